//! Console output of a tick report.

use crate::attribution::SkipReason;
use crate::model::Device;
use crate::monitor::TickReport;
use comfy_table::{presets::UTF8_FULL, Cell, ContentArrangement, Table};

const TOP_SERVICES: usize = 10;

/// Human-readable byte count (1024-based)
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

fn device_label(device: &Device) -> String {
    match &device.vpn_tag {
        Some(tag) if device.is_virtual => format!("{} (virtual)", tag),
        _ => device.display_name.clone(),
    }
}

fn new_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

/// One row per device: identity, this tick's share and running totals
pub fn device_table(report: &TickReport) -> Table {
    let mut table = new_table();
    table.set_header(vec!["Device", "IP", "MAC", "Conns", "In (tick)", "Out (tick)", "In (total)", "Out (total)"]);

    let mut rows: Vec<_> = report.devices.iter().collect();
    rows.sort_by(|a, b| {
        b.device
            .bytes_in
            .saturating_add(b.device.bytes_out)
            .cmp(&a.device.bytes_in.saturating_add(a.device.bytes_out))
            .then_with(|| a.device.key.cmp(&b.device.key))
    });

    for row in rows {
        let device = &row.device;
        table.add_row(vec![
            Cell::new(device_label(device)),
            Cell::new(device.ip.map_or("—".to_string(), |ip| ip.to_string())),
            Cell::new(device.mac.clone().unwrap_or_else(|| "—".to_string())),
            Cell::new(device.connection_count),
            Cell::new(format_bytes(row.tick_in)),
            Cell::new(format_bytes(row.tick_out)),
            Cell::new(format_bytes(device.bytes_in)),
            Cell::new(format_bytes(device.bytes_out)),
        ]);
    }
    table
}

/// Busiest services by connection count
pub fn service_table(report: &TickReport, limit: usize) -> Table {
    let mut table = new_table();
    table.set_header(vec!["Service", "Connections", "Tier", "Confidence"]);

    for (name, count) in report.services().into_iter().take(limit) {
        let example = report
            .connections
            .iter()
            .filter_map(|c| c.service.as_ref())
            .find(|s| s.service_name == name);
        let (tier, confidence) = match example {
            Some(s) if s.confidence > 0.0 => (s.tier.number().to_string(), format!("{:.0}%", s.confidence * 100.0)),
            _ => ("—".to_string(), "—".to_string()),
        };
        table.add_row(vec![
            Cell::new(name),
            Cell::new(count),
            Cell::new(tier),
            Cell::new(confidence),
        ]);
    }
    table
}

/// One-line status for the top of a refresh
pub fn status_line(report: &TickReport) -> String {
    let mut line = format!(
        "[{}] tick {} | {} devices | {} connections | in {} out {}",
        report.timestamp.format("%H:%M:%S"),
        report.tick,
        report.devices.len(),
        report.connections.len(),
        format_bytes(report.total_in),
        format_bytes(report.total_out)
    );
    match &report.skipped {
        Some(SkipReason::CollectionFailed(reason)) => line.push_str(&format!(" | skipped: {}", reason)),
        Some(SkipReason::Baseline) => line.push_str(" | baseline"),
        None => {}
    }
    if report.has_anomaly() {
        line.push_str(" | counter reset");
    }
    line
}

pub fn print_report(report: &TickReport) {
    println!("{}", status_line(report));
    println!("{}", device_table(report));
    println!("{}", service_table(report, TOP_SERVICES));
    for removed in &report.removed {
        println!("removed: {} ({})", removed.display_name, removed.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Connection, DeviceKey, Protocol, ServiceMatch, Tier};
    use crate::monitor::DeviceReport;
    use chrono::Utc;

    fn report() -> TickReport {
        let now = Utc::now();
        let key = DeviceKey::Ip("192.168.1.5".parse().unwrap());
        let mut device = Device::physical(key.clone(), Some("192.168.1.5".parse().unwrap()), None, 1, now);
        device.add_traffic(2048, 512);
        device.connection_count = 2;

        let service = ServiceMatch::matched("8.8.8.8".parse().unwrap(), "Google DNS", Tier::Range, now);
        let connection = Connection {
            local: "192.168.1.5:5000".parse().unwrap(),
            remote: "8.8.8.8:443".parse().unwrap(),
            protocol: Protocol::Tcp,
            state: "ESTABLISHED".to_string(),
            first_seen: now,
            last_seen: now,
            device: key,
            service: Some(service),
        };

        TickReport {
            tick: 7,
            timestamp: now,
            devices: vec![DeviceReport {
                device,
                tick_in: 100,
                tick_out: 20,
            }],
            connections: vec![connection.clone(), connection],
            removed: vec![],
            merged: vec![],
            total_in: 100,
            total_out: 20,
            anomalies: vec![],
            skipped: None,
        }
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn test_tables_contain_rows() {
        let report = report();
        let devices = device_table(&report).to_string();
        assert!(devices.contains("Device 192.168.1.5"));
        assert!(devices.contains("2.0 KB"));

        let services = service_table(&report, 5).to_string();
        assert!(services.contains("Google DNS"));
        assert!(services.contains("95%"));
    }

    #[test]
    fn test_saturated_totals_sort_first() {
        let mut report = report();
        let key = DeviceKey::Ip("192.168.1.9".parse().unwrap());
        let mut heavy = Device::physical(key, Some("192.168.1.9".parse().unwrap()), None, 1, Utc::now());
        heavy.add_traffic(u64::MAX, u64::MAX);
        report.devices.push(DeviceReport {
            device: heavy,
            tick_in: 0,
            tick_out: 0,
        });

        let devices = device_table(&report).to_string();
        let heavy_row = devices.find("Device 192.168.1.9").unwrap();
        let light_row = devices.find("Device 192.168.1.5").unwrap();
        assert!(heavy_row < light_row);
    }

    #[test]
    fn test_status_line_flags_skips() {
        let mut report = report();
        report.skipped = Some(SkipReason::CollectionFailed("arp unavailable".to_string()));
        assert!(status_line(&report).contains("skipped: arp unavailable"));
    }
}
