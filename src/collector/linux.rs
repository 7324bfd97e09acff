use super::{normalize_mac, select_counters, CounterTable, DataCollector};
use crate::errors::CollectionError;
use crate::model::{ArpTable, InterfaceCounterSample, Protocol, RawConnection};
use chrono::Utc;
use ipnetwork::{IpNetwork, Ipv4Network};
use log::debug;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;

/// TCP state code for ESTABLISHED in /proc/net/tcp
const TCP_ESTABLISHED: &str = "01";

/// Reads everything from the procfs network tables
pub struct LinuxCollector {
    proc_net: PathBuf,
    interface: Option<String>,
}

impl LinuxCollector {
    pub fn new(interface: Option<String>) -> Self {
        Self::with_proc_net("/proc/net", interface)
    }

    /// Read tables from another directory laid out like /proc/net
    pub fn with_proc_net(proc_net: impl Into<PathBuf>, interface: Option<String>) -> Self {
        LinuxCollector {
            proc_net: proc_net.into(),
            interface,
        }
    }

    fn read(&self, table: &str) -> Result<String, CollectionError> {
        Ok(fs::read_to_string(self.proc_net.join(table))?)
    }
}

impl DataCollector for LinuxCollector {
    fn name(&self) -> &'static str {
        "linux procfs"
    }

    fn get_arp_table(&self) -> Result<ArpTable, CollectionError> {
        parse_proc_arp(&self.read("arp")?)
    }

    fn get_connections(&self) -> Result<Vec<RawConnection>, CollectionError> {
        let mut connections = parse_proc_tcp(&self.read("tcp")?)?;
        // tcp6 is absent on kernels built without IPv6
        match self.read("tcp6") {
            Ok(contents) => connections.extend(parse_proc_tcp(&contents)?),
            Err(e) => debug!("Skipping /proc/net/tcp6: {}", e),
        }
        Ok(connections)
    }

    fn get_interface_counters(&self) -> Result<InterfaceCounterSample, CollectionError> {
        let table = parse_proc_dev(&self.read("dev")?)?;
        let (bytes_in, bytes_out) = select_counters(&table, self.interface.as_deref())?;
        Ok(InterfaceCounterSample {
            timestamp: Utc::now(),
            bytes_in,
            bytes_out,
        })
    }

    fn detect_local_network(&self) -> Result<IpNetwork, CollectionError> {
        parse_proc_route(&self.read("route")?)
    }
}

/// Parse /proc/net/arp; incomplete entries (flags 0x0) are skipped
pub fn parse_proc_arp(contents: &str) -> Result<ArpTable, CollectionError> {
    let mut table = ArpTable::new();
    for line in contents.lines().skip(1) {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 4 {
            continue;
        }
        let ip: IpAddr = parts[0]
            .parse()
            .map_err(|_| CollectionError::unparseable("arp table", format!("bad address '{}'", parts[0])))?;
        if parts[2] == "0x0" {
            continue;
        }
        if let Some(mac) = normalize_mac(parts[3]) {
            table.insert(ip, mac);
        }
    }
    Ok(table)
}

fn parse_hex_ipv4(hex: &str) -> Option<Ipv4Addr> {
    let value = u32::from_str_radix(hex, 16).ok()?;
    Some(Ipv4Addr::from(value.to_le_bytes()))
}

fn parse_hex_ipv6(hex: &str) -> Option<Ipv6Addr> {
    if hex.len() != 32 {
        return None;
    }
    let mut bytes = [0u8; 16];
    for (i, chunk) in bytes.chunks_mut(4).enumerate() {
        let word = u32::from_str_radix(&hex[i * 8..i * 8 + 8], 16).ok()?;
        chunk.copy_from_slice(&word.to_le_bytes());
    }
    Some(Ipv6Addr::from(bytes))
}

fn parse_hex_socket(field: &str) -> Option<SocketAddr> {
    let (addr, port) = field.split_once(':')?;
    let port = u16::from_str_radix(port, 16).ok()?;
    let ip = match addr.len() {
        8 => IpAddr::V4(parse_hex_ipv4(addr)?),
        32 => {
            let v6 = parse_hex_ipv6(addr)?;
            // v4-mapped sockets show up in tcp6 for dual-stack listeners
            match v6.to_ipv4_mapped() {
                Some(v4) => IpAddr::V4(v4),
                None => IpAddr::V6(v6),
            }
        }
        _ => return None,
    };
    Some(SocketAddr::new(ip, port))
}

/// Parse /proc/net/tcp or tcp6, keeping ESTABLISHED sockets only
pub fn parse_proc_tcp(contents: &str) -> Result<Vec<RawConnection>, CollectionError> {
    let mut connections = Vec::new();
    for line in contents.lines().skip(1) {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 4 {
            continue;
        }
        if parts[3] != TCP_ESTABLISHED {
            continue;
        }
        let local = parse_hex_socket(parts[1])
            .ok_or_else(|| CollectionError::unparseable("tcp table", format!("bad local address '{}'", parts[1])))?;
        let remote = parse_hex_socket(parts[2])
            .ok_or_else(|| CollectionError::unparseable("tcp table", format!("bad remote address '{}'", parts[2])))?;
        connections.push(RawConnection {
            local,
            remote,
            protocol: Protocol::Tcp,
            state: "ESTABLISHED".to_string(),
        });
    }
    Ok(connections)
}

/// Parse /proc/net/dev into interface -> (rx bytes, tx bytes)
pub(crate) fn parse_proc_dev(contents: &str) -> Result<CounterTable, CollectionError> {
    let mut table = CounterTable::new();
    for line in contents.lines().skip(2) {
        let Some((name, rest)) = line.split_once(':') else {
            continue;
        };
        let fields: Vec<&str> = rest.split_whitespace().collect();
        if fields.len() < 9 {
            return Err(CollectionError::unparseable("interface counters", line.trim()));
        }
        let rx = fields[0]
            .parse::<u64>()
            .map_err(|e| CollectionError::unparseable("interface counters", e.to_string()))?;
        let tx = fields[8]
            .parse::<u64>()
            .map_err(|e| CollectionError::unparseable("interface counters", e.to_string()))?;
        table.insert(name.trim().to_string(), (rx, tx));
    }
    Ok(table)
}

/// Derive the local CIDR from the default route's interface in /proc/net/route
pub fn parse_proc_route(contents: &str) -> Result<IpNetwork, CollectionError> {
    let rows: Vec<Vec<&str>> = contents
        .lines()
        .skip(1)
        .map(|l| l.split_whitespace().collect::<Vec<&str>>())
        .filter(|p| p.len() >= 8)
        .collect();

    let default = rows
        .iter()
        .find(|p| p[1] == "00000000")
        .ok_or_else(|| CollectionError::unparseable("route table", "no default route"))?;
    let iface = default[0];

    for row in rows.iter().filter(|p| p[0] == iface && p[1] != "00000000") {
        let (Some(dest), Some(mask)) = (parse_hex_ipv4(row[1]), parse_hex_ipv4(row[7])) else {
            continue;
        };
        let prefix = u32::from(mask).count_ones() as u8;
        if prefix == 0 || prefix == 32 {
            continue;
        }
        if let Ok(net) = Ipv4Network::new(dest, prefix) {
            return Ok(IpNetwork::V4(net));
        }
    }

    // No connected route for the interface: assume a /24 around the gateway
    let gateway = parse_hex_ipv4(default[2])
        .ok_or_else(|| CollectionError::unparseable("route table", format!("bad gateway '{}'", default[2])))?;
    let o = gateway.octets();
    Ipv4Network::new(Ipv4Addr::new(o[0], o[1], o[2], 0), 24)
        .map(IpNetwork::V4)
        .map_err(|e| CollectionError::unparseable("route table", e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const ARP: &str = "IP address       HW type     Flags       HW address            Mask     Device
192.168.1.1      0x1         0x2         aa:bb:cc:dd:ee:ff     *        eth0
192.168.1.23     0x1         0x2         10:22:33:44:55:66     *        eth0
192.168.1.99     0x1         0x0         00:00:00:00:00:00     *        eth0
";

    const TCP: &str = "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 0100007F:0277 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 1 1 0000000000000000 100 0 0 10 0
   1: 1701A8C0:D431 08080808:01BB 01 00000000:00000000 02:000A7B2C 00000000  1000        0 2 1 0000000000000000 20 4 30 10 -1
   2: 1701A8C0:D432 2A003A0D:0050 06 00000000:00000000 02:000A7B2C 00000000  1000        0 3 1 0000000000000000 20 4 30 10 -1
";

    const DEV: &str = "Inter-|   Receive                                                |  Transmit
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
    lo:  123456     100    0    0    0     0          0         0   123456     100    0    0    0     0       0          0
  eth0: 9876543    5000    0    0    0     0          0        12  1234567    4000    0    0    0     0       0          0
";

    const ROUTE: &str = "Iface\tDestination\tGateway \tFlags\tRefCnt\tUse\tMetric\tMask\t\tMTU\tWindow\tIRTT
eth0\t00000000\t0101A8C0\t0003\t0\t0\t100\t00000000\t0\t0\t0
eth0\t0001A8C0\t00000000\t0001\t0\t0\t100\t00FFFFFF\t0\t0\t0
";

    #[test]
    fn test_parse_proc_arp_skips_incomplete() {
        let table = parse_proc_arp(ARP).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table[&"192.168.1.1".parse::<IpAddr>().unwrap()], "AA:BB:CC:DD:EE:FF");
    }

    #[test]
    fn test_parse_proc_tcp_established_only() {
        let conns = parse_proc_tcp(TCP).unwrap();
        assert_eq!(conns.len(), 1);
        assert_eq!(conns[0].local, "192.168.1.23:54321".parse::<SocketAddr>().unwrap());
        assert_eq!(conns[0].remote, "8.8.8.8:443".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn test_parse_proc_tcp6_mapped_and_native() {
        let tcp6 = "  sl  local_address                         remote_address                        st
   0: 0000000000000000FFFF00001701A8C0:D431 0000000000000000FFFF000008080808:01BB 01 00000000:00000000
   1: 000080FE00000000FF02A8C0A3D1EEFE:1F90 B80D0120000000000000000001000000:0050 01 00000000:00000000
";
        let conns = parse_proc_tcp(tcp6).unwrap();
        assert_eq!(conns.len(), 2);
        assert_eq!(conns[0].remote.ip(), "8.8.8.8".parse::<IpAddr>().unwrap());
        assert_eq!(conns[1].remote.ip(), "2001:db8::1".parse::<IpAddr>().unwrap());
        assert_eq!(conns[1].remote.port(), 80);
    }

    #[test]
    fn test_parse_proc_tcp_rejects_garbage_address() {
        let bad = "header\n 0: XYZ:0001 08080808:01BB 01 0\n";
        assert!(matches!(parse_proc_tcp(bad), Err(CollectionError::Unparseable { .. })));
    }

    #[test]
    fn test_parse_proc_dev() {
        let table = parse_proc_dev(DEV).unwrap();
        assert_eq!(table["eth0"], (9876543, 1234567));
        assert_eq!(table["lo"], (123456, 123456));
    }

    #[test]
    fn test_parse_proc_route_uses_connected_route() {
        let net = parse_proc_route(ROUTE).unwrap();
        assert_eq!(net.to_string(), "192.168.1.0/24");
    }

    #[test]
    fn test_parse_proc_route_without_default() {
        let no_default = "Iface\tDestination\tGateway\tFlags\tRefCnt\tUse\tMetric\tMask\n\
eth0\t0001A8C0\t00000000\t0001\t0\t0\t100\t00FFFFFF\n";
        assert!(parse_proc_route(no_default).is_err());
    }
}
