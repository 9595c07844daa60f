//! Host metrics for the heartbeat payload.

use std::process::Command;
use std::time::Duration;

use serde_json::{json, Map, Value};
use sysinfo::{Disks, System};

/// Collects cpu/memory/disk metrics, plus GPU metrics when `nvidia-smi`
/// is present. Never fails — unavailable metrics are simply absent.
pub fn gather() -> Value {
    let mut status = Map::new();

    let mut sys = System::new();
    sys.refresh_memory();
    sys.refresh_cpu_usage();
    // CPU usage needs two samples a short interval apart.
    std::thread::sleep(Duration::from_millis(200));
    sys.refresh_cpu_usage();

    status.insert("cpu_percent".into(), json!(sys.global_cpu_usage()));
    let total = sys.total_memory();
    let used = sys.used_memory();
    if total > 0 {
        status.insert(
            "memory_percent".into(),
            json!(used as f64 / total as f64 * 100.0),
        );
        status.insert("memory_used_mb".into(), json!(used as f64 / 1048576.0));
        status.insert("memory_total_mb".into(), json!(total as f64 / 1048576.0));
    }

    let disks = Disks::new_with_refreshed_list();
    if let Some(disk) = disks.list().first() {
        let total = disk.total_space();
        let available = disk.available_space();
        if total > 0 {
            status.insert(
                "disk_percent".into(),
                json!((total - available) as f64 / total as f64 * 100.0),
            );
            status.insert(
                "disk_free_gb".into(),
                json!(available as f64 / (1024.0 * 1024.0 * 1024.0)),
            );
        }
    }

    if let Some(gpu) = query_gpu() {
        for (k, v) in gpu {
            status.insert(k, v);
        }
    }

    Value::Object(status)
}

/// Parses `nvidia-smi` CSV output, e.g. `35, 54, 1024, 8192`.
fn query_gpu() -> Option<Map<String, Value>> {
    let output = Command::new("nvidia-smi")
        .args([
            "--query-gpu=utilization.gpu,temperature.gpu,memory.used,memory.total",
            "--format=csv,noheader,nounits",
        ])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout);
    parse_gpu_csv(text.lines().next()?)
}

fn parse_gpu_csv(line: &str) -> Option<Map<String, Value>> {
    let fields: Vec<f64> = line
        .split(',')
        .map(|f| f.trim().parse::<f64>())
        .collect::<Result<_, _>>()
        .ok()?;
    if fields.len() < 4 {
        return None;
    }
    let mut gpu = Map::new();
    gpu.insert("gpu_utilization".into(), json!(fields[0]));
    gpu.insert("gpu_temperature".into(), json!(fields[1]));
    gpu.insert("gpu_memory_used_mb".into(), json!(fields[2]));
    gpu.insert("gpu_memory_total_mb".into(), json!(fields[3]));
    Some(gpu)
}
