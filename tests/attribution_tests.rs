use chrono::Utc;
use netlens::attribution::{split_exact, DeviceShare, TrafficAttributor, VirtualRanges};
use netlens::config::VirtualRange;
use netlens::errors::CounterDirection;
use netlens::model::{ArpTable, DeviceKey, InterfaceCounterSample};
use netlens::registry::DeviceRegistry;
use test_utils::{ip, tcp};


fn sample(bytes_in: u64, bytes_out: u64) -> InterfaceCounterSample {
    InterfaceCounterSample {
        timestamp: Utc::now(),
        bytes_in,
        bytes_out,
    }
}

fn mac(s: &str) -> DeviceKey {
    DeviceKey::Mac(s.to_string())
}

#[test]
fn test_three_devices_split_by_connection_count() {
    let (a, b, c) = (mac("AA:00:00:00:00:01"), mac("AA:00:00:00:00:02"), mac("AA:00:00:00:00:03"));
    let devices = vec![
        DeviceShare::new(a.clone(), 2),
        DeviceShare::new(b.clone(), 3),
        DeviceShare::new(c.clone(), 5),
    ];
    let result = TrafficAttributor::allocate(&sample(5_000, 0), &sample(6_000, 0), &devices);
    assert_eq!(result.get(&a).bytes_in, 200);
    assert_eq!(result.get(&b).bytes_in, 300);
    assert_eq!(result.get(&c).bytes_in, 500);
    assert_eq!(result.allocations.values().map(|x| x.bytes_in).sum::<u64>(), 1000);
}

#[test]
fn test_tied_remainder_goes_to_ascending_key() {
    let (a, b) = (mac("AA:00:00:00:00:01"), mac("AA:00:00:00:00:02"));
    let devices = vec![DeviceShare::new(b.clone(), 1), DeviceShare::new(a.clone(), 1)];
    let result = TrafficAttributor::allocate(&sample(0, 0), &sample(5, 5), &devices);
    assert_eq!((result.get(&a).bytes_in, result.get(&b).bytes_in), (3, 2));
    assert_eq!((result.get(&a).bytes_out, result.get(&b).bytes_out), (3, 2));
}

#[test]
fn test_counter_reset_gives_everyone_zero() {
    let devices = vec![
        DeviceShare::new(mac("AA:00:00:00:00:01"), 3),
        DeviceShare::new(mac("AA:00:00:00:00:02"), 1),
    ];
    let result = TrafficAttributor::allocate(&sample(1000, 0), &sample(800, 0), &devices);
    assert!(result.allocations.values().all(|x| x.bytes_in == 0));
    assert!(result.has_anomaly());
    assert_eq!(result.anomalies[0].direction, CounterDirection::In);
    assert_eq!((result.anomalies[0].previous, result.anomalies[0].current), (1000, 800));
}

#[test]
fn test_exact_sum_for_awkward_ratios() {
    // Connection counts chosen so no share divides evenly
    let counts = [7u32, 11, 13, 1, 3];
    let devices: Vec<DeviceShare> = counts
        .iter()
        .enumerate()
        .map(|(i, n)| DeviceShare::new(DeviceKey::Ip(ip(&format!("10.0.0.{}", i + 1))), *n))
        .collect();
    for total in [1u64, 34, 35, 1_000_001, u32::MAX as u64 * 3] {
        let parts = split_exact(total, &devices);
        assert_eq!(parts.iter().sum::<u64>(), total);
        // Nobody is more than one byte away from their exact share
        for (part, n) in parts.iter().zip(counts.iter()) {
            let exact = total as f64 * *n as f64 / 35.0;
            assert!((*part as f64 - exact).abs() <= 1.0, "{} vs {}", part, exact);
        }
    }
}

#[test]
fn test_virtual_device_shares_the_ratio_with_physical_ones() {
    let ranges = VirtualRanges::from_config(&[VirtualRange {
        tag: "WireGuard".to_string(),
        ranges: vec!["10.8.0.0/24".to_string()],
    }]);
    let mut registry = DeviceRegistry::new(ranges, 10);
    registry.update(
        &ArpTable::new(),
        &[
            tcp("10.8.0.2:40000", "142.250.1.1:443"),
            tcp("10.8.0.3:40001", "142.250.1.2:443"),
            tcp("10.8.0.4:40002", "142.250.1.3:443"),
            tcp("192.168.1.9:40003", "1.1.1.1:443"),
        ],
        1,
        Utc::now(),
    );

    let shares = registry.shares();
    let result = TrafficAttributor::allocate(&sample(0, 0), &sample(400, 0), &shares);
    assert_eq!(result.get(&DeviceKey::Virtual("WireGuard".to_string())).bytes_in, 300);
    assert_eq!(result.get(&DeviceKey::Ip(ip("192.168.1.9"))).bytes_in, 100);
}

#[test]
fn test_merged_device_keeps_history_across_ticks() {
    let mut registry = DeviceRegistry::new(VirtualRanges::default(), 10);
    let mut attributor = TrafficAttributor::new();
    let now = Utc::now();
    let phone_mac = "AA:BB:CC:00:00:42";

    // Tick 1: phone known by MAC on .42
    let mut arp = ArpTable::new();
    arp.insert(ip("192.168.1.42"), phone_mac.to_string());
    registry.update(&arp, &[tcp("192.168.1.42:5000", "1.1.1.1:443")], 1, now);
    let alloc = attributor.observe(sample(0, 0), &registry.shares());
    registry.apply(&alloc);

    // Tick 2: a second address shows up before ARP knows it
    registry.update(
        &ArpTable::new(),
        &[tcp("192.168.1.42:5000", "1.1.1.1:443"), tcp("192.168.1.43:5001", "1.1.1.1:443")],
        2,
        now,
    );
    let alloc = attributor.observe(sample(1000, 100), &registry.shares());
    registry.apply(&alloc);
    assert_eq!(registry.get(&DeviceKey::Ip(ip("192.168.1.43"))).unwrap().bytes_in, 500);

    // Tick 3: ARP maps .43 to the same MAC
    arp.insert(ip("192.168.1.43"), phone_mac.to_string());
    let update = registry.update(&arp, &[tcp("192.168.1.43:5001", "1.1.1.1:443")], 3, now);
    assert_eq!(update.merged.len(), 1);

    let phone = registry.get(&mac(phone_mac)).unwrap();
    assert_eq!(phone.bytes_in, 1000);
    assert_eq!(phone.bytes_out, 100);
    assert_eq!(registry.len(), 1);
}
