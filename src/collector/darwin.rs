use super::{normalize_mac, select_counters, CounterTable, DataCollector};
use crate::errors::CollectionError;
use crate::model::{ArpTable, InterfaceCounterSample, Protocol, RawConnection};
use chrono::Utc;
use ipnetwork::{IpNetwork, Ipv4Network};
use log::warn;
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::process::Command;

/// Collector for macOS, built on the stock `arp`, `netstat` and `route` tools
pub struct DarwinCollector {
    interface: Option<String>,
}

impl DarwinCollector {
    pub fn new(interface: Option<String>) -> Self {
        DarwinCollector { interface }
    }
}

fn run_command(program: &str, args: &[&str]) -> Result<String, CollectionError> {
    let command = format!("{} {}", program, args.join(" "));
    let output = Command::new(program).args(args).output().map_err(|e| match e.kind() {
        ErrorKind::NotFound | ErrorKind::PermissionDenied => CollectionError::CommandUnavailable {
            command: command.clone(),
            source: e,
        },
        _ => CollectionError::Io(e),
    })?;

    if !output.status.success() {
        return Err(CollectionError::CommandFailed {
            command,
            status: output.status.to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

impl DataCollector for DarwinCollector {
    fn name(&self) -> &'static str {
        "macos netstat/arp"
    }

    fn get_arp_table(&self) -> Result<ArpTable, CollectionError> {
        Ok(parse_arp_output(&run_command("arp", &["-an"])?))
    }

    fn get_connections(&self) -> Result<Vec<RawConnection>, CollectionError> {
        Ok(parse_netstat_connections(&run_command("netstat", &["-n", "-p", "tcp"])?))
    }

    fn get_interface_counters(&self) -> Result<InterfaceCounterSample, CollectionError> {
        let table = parse_netstat_interfaces(&run_command("netstat", &["-ibn"])?)?;
        let (bytes_in, bytes_out) = select_counters(&table, self.interface.as_deref())?;
        Ok(InterfaceCounterSample {
            timestamp: Utc::now(),
            bytes_in,
            bytes_out,
        })
    }

    fn detect_local_network(&self) -> Result<IpNetwork, CollectionError> {
        Ok(parse_default_route(&run_command("route", &["-n", "get", "default"])?))
    }
}

/// Parse `arp -an` lines such as
/// `? (192.168.31.1) at aa:bb:cc:dd:ee:ff on en0 ifscope [ethernet]`
pub fn parse_arp_output(output: &str) -> ArpTable {
    let mut table = ArpTable::new();
    for line in output.lines() {
        let (Some(open), Some(close)) = (line.find('('), line.find(')')) else {
            continue;
        };
        if close <= open {
            continue;
        }
        let Ok(ip) = line[open + 1..close].parse::<IpAddr>() else {
            continue;
        };
        let mut rest = line[close + 1..].split_whitespace();
        if rest.next() != Some("at") {
            continue;
        }
        if let Some(mac) = rest.next().and_then(normalize_mac) {
            table.insert(ip, mac);
        }
    }
    table
}

/// Split BSD `ip.port` notation; IPv6 scope ids are dropped
fn parse_bsd_socket(field: &str) -> Option<SocketAddr> {
    let (addr, port) = field.rsplit_once('.')?;
    let port: u16 = port.parse().ok()?;
    let addr = addr.split('%').next()?;
    let ip: IpAddr = addr.parse().ok()?;
    Some(SocketAddr::new(ip, port))
}

/// Parse `netstat -n -p tcp`, keeping ESTABLISHED rows
pub fn parse_netstat_connections(output: &str) -> Vec<RawConnection> {
    output
        .lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 6 || !parts[0].starts_with("tcp") || parts[5] != "ESTABLISHED" {
                return None;
            }
            Some(RawConnection {
                local: parse_bsd_socket(parts[3])?,
                remote: parse_bsd_socket(parts[4])?,
                protocol: Protocol::Tcp,
                state: parts[5].to_string(),
            })
        })
        .collect()
}

/// Parse `netstat -ibn`. Only the `<Link#N>` row of each interface carries
/// complete counters; columns are read from the end because the Address
/// column is empty for interfaces without a hardware address.
pub(crate) fn parse_netstat_interfaces(output: &str) -> Result<CounterTable, CollectionError> {
    let mut table = CounterTable::new();
    for line in output.lines().skip(1) {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 10 || !parts[2].starts_with("<Link#") {
            continue;
        }
        let name = parts[0].trim_end_matches('*');
        if table.contains_key(name) {
            continue;
        }
        let n = parts.len();
        let bytes_in = parts[n - 5]
            .parse::<u64>()
            .map_err(|e| CollectionError::unparseable("interface counters", format!("{}: {}", line.trim(), e)))?;
        let bytes_out = parts[n - 2]
            .parse::<u64>()
            .map_err(|e| CollectionError::unparseable("interface counters", format!("{}: {}", line.trim(), e)))?;
        table.insert(name.to_string(), (bytes_in, bytes_out));
    }
    if table.is_empty() {
        return Err(CollectionError::unparseable("interface counters", "no <Link#> rows"));
    }
    Ok(table)
}

/// Local /24 around the default gateway, 192.168.1.0/24 when none is reported
pub fn parse_default_route(output: &str) -> IpNetwork {
    let gateway = output.lines().find_map(|line| {
        let (key, value) = line.trim().split_once(':')?;
        if key.trim() != "gateway" {
            return None;
        }
        value.trim().parse::<Ipv4Addr>().ok()
    });

    let base = match gateway {
        Some(gw) => {
            let o = gw.octets();
            Ipv4Addr::new(o[0], o[1], o[2], 0)
        }
        None => {
            warn!("No default gateway reported, assuming 192.168.1.0/24");
            Ipv4Addr::new(192, 168, 1, 0)
        }
    };
    Ipv4Network::new(base, 24)
        .map(IpNetwork::V4)
        .unwrap_or_else(|_| IpNetwork::V4(Ipv4Network::from(base)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_arp_output() {
        let out = "? (192.168.31.1) at aa:bb:cc:dd:ee:ff on en0 ifscope [ethernet]
? (192.168.31.20) at 0:1b:63:a:bb:cc on en0 ifscope [ethernet]
? (192.168.31.44) at (incomplete) on en0 ifscope [ethernet]
? (224.0.0.251) at 1:0:5e:0:0:fb on en0 ifscope permanent [ethernet]
";
        let table = parse_arp_output(out);
        assert_eq!(table.len(), 3);
        assert_eq!(table[&"192.168.31.20".parse::<IpAddr>().unwrap()], "00:1B:63:0A:BB:CC");
        assert!(!table.contains_key(&"192.168.31.44".parse::<IpAddr>().unwrap()));
    }

    #[test]
    fn test_parse_netstat_connections() {
        let out = "Active Internet connections
Proto Recv-Q Send-Q  Local Address          Foreign Address        (state)
tcp4       0      0  192.168.31.31.58581    17.57.146.20.5223      ESTABLISHED
tcp4       0      0  28.0.0.1.62657         142.250.196.110.443    ESTABLISHED
tcp6       0      0  fe80::1%lo0.1024       fe80::1%lo0.50123      ESTABLISHED
tcp4       0      0  192.168.31.31.58582    17.57.146.21.443       TIME_WAIT
";
        let conns = parse_netstat_connections(out);
        assert_eq!(conns.len(), 3);
        assert_eq!(conns[0].local, "192.168.31.31:58581".parse::<SocketAddr>().unwrap());
        assert_eq!(conns[1].remote, "142.250.196.110:443".parse::<SocketAddr>().unwrap());
        assert_eq!(conns[2].local.port(), 1024);
    }

    #[test]
    fn test_parse_netstat_interfaces_reads_link_rows() {
        let out = "Name       Mtu   Network       Address            Ipkts Ierrs     Ibytes    Opkts Oerrs     Obytes  Coll
lo0        16384 <Link#1>                        1000     0     500000     1000     0     500000     0
lo0        16384 127           127.0.0.1         1000     -     500000     1000     -     500000     -
en0        1500  <Link#4>    a4:5e:60:aa:bb:cc   84000     0   98000000    52000     0    7000000     0
en0        1500  192.168.31    192.168.31.31     84000     -   98000000    52000     -    7000000     -
utun3      1380  <Link#12>                        10     0       2048       12     0       4096     0
";
        let table = parse_netstat_interfaces(out).unwrap();
        assert_eq!(table["en0"], (98000000, 7000000));
        assert_eq!(table["utun3"], (2048, 4096));
        assert_eq!(table["lo0"], (500000, 500000));
    }

    #[test]
    fn test_parse_default_route() {
        let out = "   route to: default
destination: default
       mask: default
    gateway: 192.168.31.1
  interface: en0
";
        assert_eq!(parse_default_route(out).to_string(), "192.168.31.0/24");
        assert_eq!(parse_default_route("route: writing to routing socket: not in table").to_string(), "192.168.1.0/24");
    }
}
