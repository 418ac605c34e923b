//! Local machine probe
//!
//! Reads CPU, memory, disk, uptime, and interfaces from the host OS. Every
//! sub-metric has a fallback chain; when the whole chain fails the field is
//! left empty and the failure is recorded in the sample's error list. The
//! probe itself never fails.

use anyhow::{Context, Result, anyhow, bail};
use std::net::IpAddr;
use std::time::Duration;
use tokio::process::Command;

use super::{
    CpuSection, HostSampler, Sample, SampleInterface, SystemSection, UsageSection, round_percent,
};

/// Interval between the two CPU counter reads.
const CPU_SAMPLE_INTERVAL: Duration = Duration::from_millis(100);

/// Probe for the machine the collector runs on.
#[derive(Debug, Clone, Default)]
pub struct HostProbe;

impl HostProbe {
    pub fn new() -> Self {
        Self
    }
}

impl HostSampler for HostProbe {
    async fn sample(&self) -> Sample {
        collect_host_sample().await
    }
}

/// First non-loopback IPv4 address of a non-internal interface.
pub fn primary_ipv4() -> Option<std::net::Ipv4Addr> {
    for iface in pnet::datalink::interfaces() {
        if iface.is_loopback() {
            continue;
        }
        for network in &iface.ips {
            if let IpAddr::V4(ipv4) = network.ip()
                && !ipv4.is_unspecified()
                && !ipv4.is_loopback()
            {
                return Some(ipv4);
            }
        }
    }
    None
}

async fn collect_host_sample() -> Sample {
    let mut sample = Sample::default();

    match read_system().await {
        Ok(system) => sample.system = Some(system),
        Err(e) => sample.record_error("system", e),
    }

    match read_cpu_percent().await {
        Ok(usage_percent) => sample.cpu = Some(CpuSection { usage_percent }),
        Err(e) => sample.record_error("cpu", e),
    }

    match read_memory().await {
        Ok(memory) => {
            if let Some(system) = sample.system.as_mut() {
                system.total_memory_bytes = Some(memory.total_bytes);
            }
            sample.memory = Some(memory);
        }
        Err(e) => sample.record_error("memory", e),
    }

    match read_disk().await {
        Ok(disk) => sample.disk = Some(disk),
        Err(e) => sample.record_error("disk", e),
    }

    sample.interfaces = read_interfaces();

    sample
}

// ---------------------------------------------------------------------------
// system

async fn read_system() -> Result<SystemSection> {
    Ok(SystemSection {
        hostname: read_hostname().await.unwrap_or_else(|| "unknown".to_string()),
        description: Some(format!(
            "{} {}",
            std::env::consts::OS,
            std::env::consts::ARCH
        )),
        location: None,
        contact: None,
        uptime_seconds: read_uptime().await.unwrap_or(0),
        platform: Some(std::env::consts::OS.to_string()),
        arch: Some(std::env::consts::ARCH.to_string()),
        cpu_cores: std::thread::available_parallelism()
            .ok()
            .map(|n| n.get() as u32),
        total_memory_bytes: None,
        processes: count_processes().await,
        users: count_users().await,
    })
}

async fn read_hostname() -> Option<String> {
    #[cfg(target_os = "linux")]
    if let Ok(raw) = tokio::fs::read_to_string("/proc/sys/kernel/hostname").await {
        let name = raw.trim().to_string();
        if !name.is_empty() {
            return Some(name);
        }
    }

    if let Ok(output) = Command::new("hostname").output().await
        && output.status.success()
    {
        let name = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if !name.is_empty() {
            return Some(name);
        }
    }

    std::env::var("COMPUTERNAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .ok()
        .filter(|name| !name.is_empty())
}

async fn read_uptime() -> Result<u64> {
    #[cfg(target_os = "linux")]
    {
        let raw = tokio::fs::read_to_string("/proc/uptime")
            .await
            .context("reading /proc/uptime")?;
        let seconds: f64 = raw
            .split_whitespace()
            .next()
            .ok_or_else(|| anyhow!("empty /proc/uptime"))?
            .parse()
            .context("parsing /proc/uptime")?;
        return Ok(seconds as u64);
    }

    #[cfg(target_os = "macos")]
    {
        // kern.boottime prints "{ sec = 1690000000, usec = 0 } ..."
        let output = run_command("sysctl", &["-n", "kern.boottime"]).await?;
        let boot_secs: i64 = output
            .split(['=', ','])
            .nth(1)
            .map(str::trim)
            .ok_or_else(|| anyhow!("unexpected kern.boottime output"))?
            .parse()
            .context("parsing kern.boottime")?;
        let now = chrono::Utc::now().timestamp();
        return Ok((now - boot_secs).max(0) as u64);
    }

    #[cfg(target_os = "windows")]
    {
        let output = run_command(
            "powershell",
            &[
                "-NoProfile",
                "-Command",
                "[int]((Get-Date) - (Get-CimInstance Win32_OperatingSystem).LastBootUpTime).TotalSeconds",
            ],
        )
        .await?;
        return output.trim().parse().context("parsing uptime seconds");
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    {
        bail!("uptime unsupported on this platform")
    }
}

async fn count_processes() -> u32 {
    #[cfg(target_os = "linux")]
    {
        let mut count = 0u32;
        if let Ok(mut dir) = tokio::fs::read_dir("/proc").await {
            while let Ok(Some(entry)) = dir.next_entry().await {
                if entry
                    .file_name()
                    .to_string_lossy()
                    .chars()
                    .all(|c| c.is_ascii_digit())
                {
                    count += 1;
                }
            }
        }
        return count;
    }

    #[cfg(not(target_os = "linux"))]
    {
        0
    }
}

async fn count_users() -> u32 {
    #[cfg(unix)]
    {
        if let Ok(output) = Command::new("who").output().await
            && output.status.success()
        {
            return String::from_utf8_lossy(&output.stdout)
                .lines()
                .filter(|line| !line.trim().is_empty())
                .count() as u32;
        }
    }

    0
}

// ---------------------------------------------------------------------------
// cpu

async fn read_cpu_percent() -> Result<u8> {
    #[cfg(target_os = "linux")]
    match cpu_from_proc_stat().await {
        Ok(percent) => return Ok(percent),
        Err(e) => tracing::debug!("proc stat CPU read failed, falling back: {}", e),
    }

    #[cfg(target_os = "macos")]
    match cpu_from_top().await {
        Ok(percent) => return Ok(percent),
        Err(e) => tracing::debug!("top CPU read failed, falling back: {}", e),
    }

    #[cfg(target_os = "windows")]
    match cpu_from_cim().await {
        Ok(percent) => return Ok(percent),
        Err(e) => tracing::debug!("CIM CPU read failed, falling back: {}", e),
    }

    cpu_from_process_delta().await
}

#[cfg(target_os = "linux")]
async fn cpu_from_proc_stat() -> Result<u8> {
    fn read_counters(raw: &str) -> Result<(u64, u64)> {
        // cpu  user nice system idle iowait irq softirq steal ...
        let line = raw
            .lines()
            .next()
            .ok_or_else(|| anyhow!("empty /proc/stat"))?;
        let fields: Vec<u64> = line
            .split_whitespace()
            .skip(1)
            .filter_map(|f| f.parse().ok())
            .collect();
        if fields.len() < 4 {
            bail!("short cpu line in /proc/stat");
        }
        let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
        let total: u64 = fields.iter().sum();
        Ok((idle, total))
    }

    let first = tokio::fs::read_to_string("/proc/stat")
        .await
        .context("reading /proc/stat")?;
    let (idle_a, total_a) = read_counters(&first)?;

    tokio::time::sleep(CPU_SAMPLE_INTERVAL).await;

    let second = tokio::fs::read_to_string("/proc/stat")
        .await
        .context("reading /proc/stat")?;
    let (idle_b, total_b) = read_counters(&second)?;

    let total_delta = total_b.saturating_sub(total_a);
    if total_delta == 0 {
        bail!("no cpu time elapsed between reads");
    }
    let idle_delta = idle_b.saturating_sub(idle_a);
    let busy = 100.0 - (idle_delta as f64 / total_delta as f64) * 100.0;
    Ok(round_percent(busy))
}

#[cfg(target_os = "macos")]
async fn cpu_from_top() -> Result<u8> {
    let output = run_command("top", &["-l", "1", "-n", "0"]).await?;
    let line = output
        .lines()
        .find(|line| line.contains("CPU usage"))
        .ok_or_else(|| anyhow!("no CPU usage line in top output"))?;
    // "CPU usage: 7.84% user, 10.9% sys, 81.25% idle"
    let user = line
        .split(':')
        .nth(1)
        .and_then(|rest| rest.split('%').next())
        .map(str::trim)
        .ok_or_else(|| anyhow!("unexpected CPU usage line: {}", line))?;
    let percent: f64 = user.parse().context("parsing top user percent")?;
    Ok(round_percent(percent))
}

#[cfg(target_os = "windows")]
async fn cpu_from_cim() -> Result<u8> {
    let average = run_command(
        "powershell",
        &[
            "-NoProfile",
            "-Command",
            "(Get-CimInstance Win32_Processor | Measure-Object -Property LoadPercentage -Average).Average",
        ],
    )
    .await?;
    if let Ok(percent) = average.trim().parse::<f64>() {
        return Ok(round_percent(percent));
    }

    let single = run_command("wmic", &["cpu", "get", "loadpercentage", "/value"]).await?;
    let percent: f64 = single
        .lines()
        .find_map(|line| line.trim().strip_prefix("LoadPercentage="))
        .ok_or_else(|| anyhow!("no LoadPercentage in wmic output"))?
        .parse()
        .context("parsing wmic load percent")?;
    Ok(round_percent(percent))
}

/// Last-resort approximation: this process's CPU time over a short window.
async fn cpu_from_process_delta() -> Result<u8> {
    #[cfg(unix)]
    {
        fn process_cpu_micros() -> Result<u64> {
            let mut usage = std::mem::MaybeUninit::<libc::rusage>::zeroed();
            // SAFETY: RUSAGE_SELF with a zeroed out-param is the documented use.
            let rc = unsafe { libc::getrusage(libc::RUSAGE_SELF, usage.as_mut_ptr()) };
            if rc != 0 {
                bail!("getrusage failed");
            }
            let usage = unsafe { usage.assume_init() };
            let user = usage.ru_utime.tv_sec as u64 * 1_000_000 + usage.ru_utime.tv_usec as u64;
            let sys = usage.ru_stime.tv_sec as u64 * 1_000_000 + usage.ru_stime.tv_usec as u64;
            Ok(user + sys)
        }

        let before = process_cpu_micros()?;
        tokio::time::sleep(CPU_SAMPLE_INTERVAL).await;
        let after = process_cpu_micros()?;

        let busy_micros = after.saturating_sub(before) as f64;
        let percent = busy_micros / CPU_SAMPLE_INTERVAL.as_micros() as f64 * 100.0;
        return Ok(round_percent(percent));
    }

    #[cfg(not(unix))]
    {
        bail!("process CPU delta unsupported on this platform")
    }
}

// ---------------------------------------------------------------------------
// memory

async fn read_memory() -> Result<UsageSection> {
    let (total_bytes, free_bytes) = read_memory_total_free().await?;
    if total_bytes == 0 {
        bail!("total memory reported as zero");
    }
    let used_bytes = total_bytes.saturating_sub(free_bytes);
    Ok(UsageSection {
        usage_percent: round_percent(used_bytes as f64 / total_bytes as f64 * 100.0),
        total_bytes,
        used_bytes,
    })
}

async fn read_memory_total_free() -> Result<(u64, u64)> {
    #[cfg(target_os = "linux")]
    {
        let raw = tokio::fs::read_to_string("/proc/meminfo")
            .await
            .context("reading /proc/meminfo")?;
        let field_kb = |name: &str| -> Option<u64> {
            raw.lines()
                .find(|line| line.starts_with(name))
                .and_then(|line| line.split_whitespace().nth(1))
                .and_then(|v| v.parse().ok())
        };
        let total = field_kb("MemTotal:").ok_or_else(|| anyhow!("no MemTotal"))? * 1024;
        let free = field_kb("MemAvailable:")
            .or_else(|| field_kb("MemFree:"))
            .ok_or_else(|| anyhow!("no MemAvailable"))?
            * 1024;
        return Ok((total, free));
    }

    #[cfg(target_os = "macos")]
    {
        let total: u64 = run_command("sysctl", &["-n", "hw.memsize"])
            .await?
            .trim()
            .parse()
            .context("parsing hw.memsize")?;

        let vm_stat = run_command("vm_stat", &[]).await?;
        let page_size: u64 = vm_stat
            .lines()
            .next()
            .and_then(|line| line.split("page size of").nth(1))
            .and_then(|rest| rest.split_whitespace().next())
            .and_then(|v| v.parse().ok())
            .unwrap_or(4096);
        let pages = |name: &str| -> u64 {
            vm_stat
                .lines()
                .find(|line| line.trim_start().starts_with(name))
                .and_then(|line| line.split(':').nth(1))
                .map(|v| v.trim().trim_end_matches('.'))
                .and_then(|v| v.parse().ok())
                .unwrap_or(0)
        };
        let free = (pages("Pages free") + pages("Pages inactive")) * page_size;
        return Ok((total, free));
    }

    #[cfg(target_os = "windows")]
    {
        let output = run_command(
            "powershell",
            &[
                "-NoProfile",
                "-Command",
                "Get-CimInstance Win32_OperatingSystem | \
                 ForEach-Object { \"$($_.TotalVisibleMemorySize) $($_.FreePhysicalMemory)\" }",
            ],
        )
        .await?;
        let mut fields = output.split_whitespace();
        let total_kb: u64 = fields
            .next()
            .ok_or_else(|| anyhow!("no TotalVisibleMemorySize"))?
            .parse()
            .context("parsing total memory")?;
        let free_kb: u64 = fields
            .next()
            .ok_or_else(|| anyhow!("no FreePhysicalMemory"))?
            .parse()
            .context("parsing free memory")?;
        return Ok((total_kb * 1024, free_kb * 1024));
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    {
        bail!("memory probe unsupported on this platform")
    }
}

// ---------------------------------------------------------------------------
// disk

async fn read_disk() -> Result<UsageSection> {
    #[cfg(unix)]
    {
        let output = run_command("df", &["-h", "/"]).await?;
        return parse_df_root(&output);
    }

    #[cfg(target_os = "windows")]
    {
        let output = run_command(
            "powershell",
            &[
                "-NoProfile",
                "-Command",
                "Get-CimInstance Win32_LogicalDisk -Filter 'DriveType=3' | \
                 ForEach-Object { \"$($_.Size) $($_.FreeSpace)\" }",
            ],
        )
        .await?;
        let mut total: u64 = 0;
        let mut free: u64 = 0;
        for line in output.lines() {
            let mut fields = line.split_whitespace();
            let size: u64 = fields.next().and_then(|v| v.parse().ok()).unwrap_or(0);
            if size == 0 {
                continue;
            }
            total += size;
            free += fields.next().and_then(|v| v.parse().ok()).unwrap_or(0);
        }
        if total == 0 {
            bail!("no local logical drives reported");
        }
        let used = total.saturating_sub(free);
        return Ok(UsageSection {
            usage_percent: round_percent(used as f64 / total as f64 * 100.0),
            total_bytes: total,
            used_bytes: used,
        });
    }

    #[cfg(not(any(unix, target_os = "windows")))]
    {
        bail!("disk probe unsupported on this platform")
    }
}

/// Scale a `df -h` figure into kilobytes by its suffix.
fn df_size_to_kb(field: &str) -> Option<f64> {
    let field = field.trim();
    if field.is_empty() {
        return None;
    }
    let (number, scale) = match field.chars().last()? {
        'K' | 'k' => (&field[..field.len() - 1], 1.0),
        'M' | 'm' => (&field[..field.len() - 1], 1024.0),
        'G' | 'g' => (&field[..field.len() - 1], 1024.0 * 1024.0),
        'T' | 't' => (&field[..field.len() - 1], 1024.0 * 1024.0 * 1024.0),
        c if c.is_ascii_digit() => (field, 1.0 / 1024.0),
        _ => return None,
    };
    let value: f64 = number.parse().ok()?;
    Some(value * scale)
}

#[cfg_attr(not(unix), allow(dead_code))]
fn parse_df_root(output: &str) -> Result<UsageSection> {
    let line = output
        .lines()
        .nth(1)
        .ok_or_else(|| anyhow!("short df output"))?;
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 4 {
        bail!("unexpected df line: {}", line);
    }

    let total_kb = df_size_to_kb(fields[1]).ok_or_else(|| anyhow!("bad df size {}", fields[1]))?;
    let used_kb = df_size_to_kb(fields[2]).ok_or_else(|| anyhow!("bad df used {}", fields[2]))?;
    if total_kb <= 0.0 {
        bail!("df reported zero-size root filesystem");
    }

    Ok(UsageSection {
        usage_percent: round_percent(used_kb / total_kb * 100.0),
        total_bytes: (total_kb * 1024.0) as u64,
        used_bytes: (used_kb * 1024.0) as u64,
    })
}

// ---------------------------------------------------------------------------
// interfaces

fn read_interfaces() -> Vec<SampleInterface> {
    pnet::datalink::interfaces()
        .into_iter()
        .map(|iface| SampleInterface {
            index: iface.index as i64,
            name: iface.name.clone(),
            description: if iface.description.is_empty() {
                None
            } else {
                Some(iface.description.clone())
            },
            mac: iface.mac.map(|mac| mac.to_string()),
            addrs: iface.ips.iter().map(|network| network.to_string()).collect(),
            iface_type: 0,
            speed: 0,
            admin_status: if iface.is_up() { 1 } else { 2 },
            oper_status: if iface.is_up() { 1 } else { 2 },
            in_octets: 0,
            out_octets: 0,
            internal: iface.is_loopback(),
        })
        .collect()
}

async fn run_command(program: &str, args: &[&str]) -> Result<String> {
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .with_context(|| format!("spawning {}", program))?;
    if !output.status.success() {
        bail!("{} exited with {}", program, output.status);
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_df_suffix_scaling() {
        assert_eq!(df_size_to_kb("100K"), Some(100.0));
        assert_eq!(df_size_to_kb("2M"), Some(2048.0));
        assert_eq!(df_size_to_kb("1G"), Some(1024.0 * 1024.0));
        assert_eq!(df_size_to_kb("1T"), Some(1024.0 * 1024.0 * 1024.0));
        // plain number means bytes
        assert_eq!(df_size_to_kb("2048"), Some(2.0));
        assert_eq!(df_size_to_kb(""), None);
        assert_eq!(df_size_to_kb("abc"), None);
    }

    #[test]
    fn test_parse_df_root() {
        let output = "Filesystem      Size  Used Avail Use% Mounted on\n\
                      /dev/sda2       100G   46G   54G  46% /\n";
        let disk = parse_df_root(output).unwrap();
        assert_eq!(disk.usage_percent, 46);
        assert_eq!(disk.total_bytes, 100 * 1024 * 1024 * 1024);
        assert_eq!(disk.used_bytes, 46 * 1024 * 1024 * 1024);
    }

    #[test]
    fn test_parse_df_rejects_garbage() {
        assert!(parse_df_root("no header").is_err());
        assert!(parse_df_root("header\n/dev/sda2 bogus\n").is_err());
    }

    #[tokio::test]
    async fn test_sample_never_fails() {
        let sample = HostProbe::new().sample().await;
        // Whatever this box looks like, the probe must come back with a
        // sample; missing pieces are reported as errors instead.
        if sample.cpu.is_none() {
            assert!(sample.errors.iter().any(|e| e.starts_with("cpu")));
        }
        if let Some(memory) = sample.memory {
            assert!(memory.usage_percent <= 100);
            assert!(memory.used_bytes <= memory.total_bytes);
        }
    }
}
