//! On-disk formats for the host store and the rule list.
//!
//! The hosts file is a sequence of `key value` blocks separated by blank
//! lines; the rules file is one glob pattern per line. Both are plain
//! text so an administrator can edit them by hand while the gateway is
//! down.

use std::{fs, io, path::Path};

use crate::authz::{Host, HostRef};

pub fn load_hosts(path: &Path) -> io::Result<Vec<Host>> {
    let data = fs::read_to_string(path)?;
    Ok(data
        .split("\n\n")
        .filter(|block| !block.trim().is_empty())
        .filter_map(Host::from_block)
        .collect())
}

pub fn save_hosts(path: &Path, hosts: &[HostRef]) -> io::Result<()> {
    let mut out = String::new();
    for host in hosts {
        out.push_str(&host.borrow().to_block());
        out.push('\n');
    }
    fs::write(path, out)
}

pub fn load_rules(path: &Path) -> io::Result<Vec<String>> {
    let data = fs::read_to_string(path)?;
    Ok(data
        .lines()
        .map(|line| line.trim_end_matches('\r').to_string())
        .filter(|line| !line.is_empty())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{cell::RefCell, rc::Rc};
    use tempfile::TempDir;

    #[test]
    fn hosts_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("known_hosts");

        let mut a = Host::new("a.com", 443, 7);
        a.authorize(Some("a.com:*"));
        a.add_rx_bytes(10);
        let b = Host::new("b.com", 80, 0);

        let refs: Vec<HostRef> = vec![Rc::new(RefCell::new(a)), Rc::new(RefCell::new(b))];
        save_hosts(&path, &refs).unwrap();

        let restored = load_hosts(&path).unwrap();
        assert_eq!(restored.len(), 2);
        assert_eq!(restored[0].name(), "a.com");
        assert_eq!(restored[0].visits(), 7);
        assert_eq!(restored[0].pattern(), Some("a.com:*"));
        assert_eq!(restored[1].name(), "b.com");
        assert!(restored[1].is_held());
    }

    #[test]
    fn missing_hosts_file_is_an_io_error() {
        let dir = TempDir::new().unwrap();
        assert!(load_hosts(&dir.path().join("absent")).is_err());
    }

    #[test]
    fn rules_file_skips_blank_lines_and_crlf() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rules");
        fs::write(&path, "*.example.com:443\r\n\n*:8080\n").unwrap();
        let rules = load_rules(&path).unwrap();
        assert_eq!(rules, vec!["*.example.com:443", "*:8080"]);
    }
}
