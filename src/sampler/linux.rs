use super::Sampler;
use crate::measure::{ProcessMeasurement, SystemMeasurement};
use std::collections::HashMap;
use std::ffi::CStr;
use std::fs;
use std::path::Path;
use std::time::Instant;

/// Limit for the getpwuid_r buffer; lookups needing more fail over to the
/// numeric uid.
const MAX_PASSWD_BUFFER: usize = 64 * 1024;

#[derive(Clone)]
struct CpuSample {
    total_ticks: u64, // utime + stime
    start_time_ticks: u64,
    timestamp: Instant,
}

struct CpuTotals {
    busy: u64,
    total: u64,
}

/// Fields of /proc/pid/stat needed for a measurement, counted from the
/// last ')' because the command name may itself contain spaces or
/// parentheses.
struct ProcStat {
    state: char,
    utime: u64,
    stime: u64,
    start_time_ticks: u64,
    rss_pages: u64,
}

impl ProcStat {
    fn parse(content: &str) -> Option<Self> {
        let name_end = content.rfind(')')?;
        let rest = content.get(name_end + 2..)?;
        let fields: Vec<&str> = rest.split_whitespace().collect();
        // fields[0] is field 3 of proc(5); utime is field 14, stime 15,
        // starttime 22, rss 24.
        Some(ProcStat {
            state: fields.first()?.chars().next()?,
            utime: fields.get(11)?.parse().ok()?,
            stime: fields.get(12)?.parse().ok()?,
            start_time_ticks: fields.get(19)?.parse().ok()?,
            rss_pages: fields.get(21)?.parse().ok()?,
        })
    }
}

/// Samples the process table and host counters from /proc.
///
/// Per-process CPU usage is the delta of utime+stime against the previous
/// tick, so the first sight of a process reads as zero. Processes whose
/// effective uid lies below `min_uid` are reported without a username.
pub struct LinuxSampler {
    min_uid: u32,
    page_size: u64,
    clock_ticks: u64,
    boot_time: u64,
    total_memory: u64,
    cpu_samples: HashMap<u32, CpuSample>,
    cpu_totals: Option<CpuTotals>,
    usernames: HashMap<u32, String>,
}

impl LinuxSampler {
    pub fn new(min_uid: u32) -> Self {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as u64 };
        let clock_ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) as u64 };
        Self {
            min_uid,
            page_size,
            clock_ticks: clock_ticks.max(1),
            boot_time: Self::get_boot_time(),
            total_memory: Self::get_total_memory().max(1),
            cpu_samples: HashMap::new(),
            cpu_totals: None,
            usernames: HashMap::new(),
        }
    }

    fn get_boot_time() -> u64 {
        let stat = fs::read_to_string("/proc/stat").unwrap_or_default();
        for line in stat.lines() {
            if let Some(rest) = line.strip_prefix("btime ") {
                return rest.trim().parse().unwrap_or(0);
            }
        }
        0
    }

    fn get_total_memory() -> u64 {
        let meminfo = fs::read_to_string("/proc/meminfo").unwrap_or_default();
        for line in meminfo.lines() {
            if let Some(rest) = line.strip_prefix("MemTotal:") {
                let kb: u64 = rest
                    .split_whitespace()
                    .next()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0);
                return kb * 1024;
            }
        }
        0
    }

    fn parse_process(
        &mut self,
        pid: u32,
        time_start: f64,
        time_end: f64,
    ) -> Option<ProcessMeasurement> {
        let proc_path = format!("/proc/{}", pid);
        let proc_dir = Path::new(&proc_path);

        let stat_content = fs::read_to_string(proc_dir.join("stat")).ok()?;
        let stat = ProcStat::parse(&stat_content)?;
        // Zombies hold no resources and will never run again.
        if stat.state == 'Z' {
            return None;
        }

        let (real_uid, effective_uid) = Self::read_uids(proc_dir)?;
        let username = if effective_uid < self.min_uid {
            None
        } else {
            Some(self.resolve_username(real_uid))
        };

        let cpu_usage = self.cpu_fraction(pid, &stat);
        let mem_usage =
            stat.rss_pages.saturating_mul(self.page_size) as f64 / self.total_memory as f64;
        let create_time = self.boot_time + stat.start_time_ticks / self.clock_ticks;
        let command = Self::read_command(proc_dir);

        Some(ProcessMeasurement {
            pid,
            username,
            time_start,
            time_end,
            cpu_usage,
            mem_usage,
            command,
            create_time: Some(create_time),
        })
    }

    /// CPU use as a fraction of one core since the previous sighting. The
    /// creation time guards against a recycled pid inheriting the old
    /// counters.
    fn cpu_fraction(&mut self, pid: u32, stat: &ProcStat) -> f64 {
        let total_ticks = stat.utime + stat.stime;
        let now = Instant::now();
        let fraction = match self.cpu_samples.get(&pid) {
            Some(prev) if prev.start_time_ticks == stat.start_time_ticks => {
                let tick_delta = total_ticks.saturating_sub(prev.total_ticks);
                let time_delta = now.duration_since(prev.timestamp).as_secs_f64();
                if time_delta > 0.0 {
                    (tick_delta as f64 / self.clock_ticks as f64) / time_delta
                } else {
                    0.0
                }
            }
            _ => 0.0, // first sample, no previous data
        };
        self.cpu_samples.insert(
            pid,
            CpuSample {
                total_ticks,
                start_time_ticks: stat.start_time_ticks,
                timestamp: now,
            },
        );
        fraction
    }

    /// Real and effective uid from the status file.
    fn read_uids(proc_dir: &Path) -> Option<(u32, u32)> {
        let status = fs::read_to_string(proc_dir.join("status")).ok()?;
        for line in status.lines() {
            if let Some(rest) = line.strip_prefix("Uid:") {
                // Uid: real effective saved filesystem
                let mut fields = rest.split_whitespace();
                let real = fields.next()?.parse().ok()?;
                let effective = fields.next()?.parse().ok()?;
                return Some((real, effective));
            }
        }
        None
    }

    fn read_command(proc_dir: &Path) -> Option<Vec<String>> {
        let raw = fs::read(proc_dir.join("cmdline")).ok()?;
        let args: Vec<String> = raw
            .split(|&b| b == 0)
            .filter(|part| !part.is_empty())
            .map(|part| String::from_utf8_lossy(part).into_owned())
            .collect();
        if args.is_empty() {
            None
        } else {
            Some(args)
        }
    }

    fn resolve_username(&mut self, uid: u32) -> String {
        if let Some(name) = self.usernames.get(&uid) {
            return name.clone();
        }
        let name = Self::lookup_username(uid).unwrap_or_else(|| uid.to_string());
        self.usernames.insert(uid, name.clone());
        name
    }

    fn lookup_username(uid: u32) -> Option<String> {
        let mut buffer: Vec<libc::c_char> = vec![0; 1024];
        loop {
            let mut passwd: libc::passwd = unsafe { std::mem::zeroed() };
            let mut result: *mut libc::passwd = std::ptr::null_mut();
            let rc = unsafe {
                libc::getpwuid_r(
                    uid,
                    &mut passwd,
                    buffer.as_mut_ptr(),
                    buffer.len(),
                    &mut result,
                )
            };
            if rc == libc::ERANGE && buffer.len() < MAX_PASSWD_BUFFER {
                buffer.resize(buffer.len() * 2, 0);
                continue;
            }
            if rc != 0 || result.is_null() {
                return None;
            }
            let name = unsafe { CStr::from_ptr(passwd.pw_name) };
            return name.to_str().ok().map(str::to_owned);
        }
    }

    /// Busy fraction across all cores from the aggregate cpu line, as a
    /// delta against the previous tick.
    fn system_cpu(&mut self) -> f64 {
        let Some(totals) = Self::read_cpu_totals() else {
            return 0.0;
        };
        let fraction = match &self.cpu_totals {
            Some(prev) => {
                let busy = totals.busy.saturating_sub(prev.busy);
                let total = totals.total.saturating_sub(prev.total);
                if total > 0 {
                    busy as f64 / total as f64
                } else {
                    0.0
                }
            }
            None => 0.0,
        };
        self.cpu_totals = Some(totals);
        fraction
    }

    fn read_cpu_totals() -> Option<CpuTotals> {
        let stat = fs::read_to_string("/proc/stat").ok()?;
        // cpu  user nice system idle iowait irq softirq steal
        // guest and beyond are already included in user.
        let line = stat.lines().next()?;
        let values: Vec<u64> = line
            .split_whitespace()
            .skip(1)
            .take(8)
            .filter_map(|v| v.parse().ok())
            .collect();
        if values.len() < 4 {
            return None;
        }
        let total: u64 = values.iter().sum();
        let idle = values[3] + values.get(4).copied().unwrap_or(0);
        Some(CpuTotals {
            busy: total.saturating_sub(idle),
            total,
        })
    }

    fn memory_fraction() -> f64 {
        let meminfo = fs::read_to_string("/proc/meminfo").unwrap_or_default();
        let mut total: u64 = 0;
        let mut available: u64 = 0;
        for line in meminfo.lines() {
            let (target, rest) = if let Some(rest) = line.strip_prefix("MemTotal:") {
                (&mut total, rest)
            } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
                (&mut available, rest)
            } else {
                continue;
            };
            if let Some(kb) = rest
                .split_whitespace()
                .next()
                .and_then(|v| v.parse::<u64>().ok())
            {
                *target = kb;
            }
        }
        if total == 0 {
            return 0.0;
        }
        1.0 - available as f64 / total as f64
    }
}

impl Sampler for LinuxSampler {
    fn collect(
        &mut self,
        time_start: f64,
        time_end: f64,
    ) -> (SystemMeasurement, Vec<ProcessMeasurement>) {
        let mut processes = Vec::new();
        if let Ok(entries) = fs::read_dir("/proc") {
            for entry in entries.flatten() {
                if let Some(name) = entry.file_name().to_str() {
                    if let Ok(pid) = name.parse::<u32>() {
                        if let Some(measurement) = self.parse_process(pid, time_start, time_end) {
                            processes.push(measurement);
                        }
                    }
                }
            }
        }
        processes.sort_by_key(|m| m.pid);

        // Drop CPU samples of processes that no longer exist.
        let pids: Vec<u32> = processes.iter().map(|m| m.pid).collect();
        self.cpu_samples.retain(|pid, _| pids.contains(pid));

        let system = SystemMeasurement::from_processes(
            &processes,
            self.system_cpu(),
            Self::memory_fraction(),
            time_start,
            time_end,
        );
        (system, processes)
    }
}
