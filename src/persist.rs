use std::convert::TryInto;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::contact::Contact;
use crate::key::NodeId;

/// Bootstrap contact records are capped so a misbehaving or very old node
/// doesn't grow `.kadconfig` without bound.
pub const MAX_BOOTSTRAP_RECORDS: usize = 10_000;

/// One `.kadconfig` record. `node_id` is carried in hex on the wire, per the
/// bootstrap file's external format (§6); `local_ip`/`local_port` are
/// optional since a directly-addressed contact may have no distinct local
/// address worth persisting.
#[derive(Clone, Debug, PartialEq)]
pub struct BootstrapContact {
    pub node_id: NodeId,
    pub ip: String,
    pub port: u16,
    pub local_ip: Option<String>,
    pub local_port: Option<u16>,
}

#[derive(Serialize, Deserialize)]
struct WireRecord {
    node_id_hex: String,
    ip: String,
    port: u16,
    local_ip: Option<String>,
    local_port: Option<u16>,
}

impl From<&Contact> for BootstrapContact {
    fn from(c: &Contact) -> Self {
        BootstrapContact {
            node_id: c.node_id,
            ip: c.host_ip.clone(),
            port: c.host_port,
            local_ip: if c.local_ip.is_empty() { None } else { Some(c.local_ip.clone()) },
            local_port: if c.local_port == 0 { None } else { Some(c.local_port) },
        }
    }
}

impl From<&BootstrapContact> for Contact {
    fn from(b: &BootstrapContact) -> Self {
        let mut c = Contact::new(b.node_id, b.ip.clone(), b.port);
        if let Some(ref ip) = b.local_ip {
            c.local_ip = ip.clone();
        }
        if let Some(port) = b.local_port {
            c.local_port = port;
        }
        c
    }
}

/// Owns the on-disk `.kadconfig` bootstrap-contacts snapshot: a
/// length-delimited record stream, rewritten atomically (write-to-temp +
/// rename) under a dedicated mutex decoupled from the routing-table lock.
pub struct BootstrapFile {
    path: PathBuf,
    lock: Mutex<()>,
}

impl BootstrapFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        BootstrapFile { path: path.into(), lock: Mutex::new(()) }
    }

    /// Loads the snapshot. Any parse failure (missing file, truncated
    /// stream, bad hex) is treated as "start empty" per spec, not an error.
    pub fn load(&self) -> Vec<BootstrapContact> {
        let _guard = self.lock.lock().unwrap();
        match Self::read_records(&self.path) {
            Ok(records) => records,
            Err(e) => {
                debug!("bootstrap file {}: {} (starting empty)", self.path.display(), e);
                Vec::new()
            },
        }
    }

    fn read_records(path: &Path) -> io::Result<Vec<BootstrapContact>> {
        let mut file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;

        let mut records = Vec::new();
        let mut offset = 0;
        while offset < buf.len() {
            if offset + 4 > buf.len() {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated record length"));
            }
            let len = u32::from_be_bytes(buf[offset..offset + 4].try_into().unwrap()) as usize;
            offset += 4;
            if offset + len > buf.len() {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated record body"));
            }
            let wire: WireRecord = bincode::deserialize(&buf[offset..offset + len])
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            offset += len;

            let node_id = NodeId::from_hex(&wire.node_id_hex)
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "bad node_id hex"))?;
            records.push(BootstrapContact {
                node_id,
                ip: wire.ip,
                port: wire.port,
                local_ip: wire.local_ip,
                local_port: wire.local_port,
            });
        }
        Ok(records)
    }

    /// Atomically rewrites the snapshot (whole-file write-to-temp +
    /// rename). `primary`, if given and present in `contacts`, is written
    /// first — the node's own last-used primary bootstrap contact.
    pub fn save(&self, contacts: &[BootstrapContact], primary: Option<&NodeId>) -> io::Result<()> {
        let _guard = self.lock.lock().unwrap();

        let mut ordered: Vec<&BootstrapContact> = Vec::with_capacity(contacts.len());
        if let Some(p) = primary {
            ordered.extend(contacts.iter().filter(|c| &c.node_id == p));
        }
        ordered.extend(contacts.iter().filter(|c| Some(&c.node_id) != primary));
        ordered.truncate(MAX_BOOTSTRAP_RECORDS);

        let mut buf = Vec::new();
        for record in ordered {
            let wire = WireRecord {
                node_id_hex: record.node_id.to_hex(),
                ip: record.ip.clone(),
                port: record.port,
                local_ip: record.local_ip.clone(),
                local_port: record.local_port,
            };
            let bytes = bincode::serialize(&wire).expect("bootstrap record is always serializable");
            buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
            buf.extend_from_slice(&bytes);
        }

        let tmp_path = self.path.with_extension("kadconfig.tmp");
        if let Some(parent) = tmp_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(&buf)?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("kad-core-test-{}-{}.kadconfig", name, std::process::id()));
        p
    }

    #[test]
    fn test_save_then_load_roundtrip() {
        let path = temp_path("roundtrip");
        let file = BootstrapFile::new(&path);
        let contacts = vec![
            BootstrapContact {
                node_id: NodeId::rand(),
                ip: "10.0.0.1".to_string(),
                port: 9000,
                local_ip: Some("192.168.1.5".to_string()),
                local_port: Some(9001),
            },
            BootstrapContact {
                node_id: NodeId::rand(),
                ip: "10.0.0.2".to_string(),
                port: 9002,
                local_ip: None,
                local_port: None,
            },
        ];
        file.save(&contacts, None).unwrap();
        let loaded = file.load();
        assert_eq!(loaded.len(), 2);
        assert!(loaded.contains(&contacts[0]));
        assert!(loaded.contains(&contacts[1]));
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_primary_written_first() {
        let path = temp_path("primary");
        let file = BootstrapFile::new(&path);
        let a = BootstrapContact { node_id: NodeId::rand(), ip: "1.1.1.1".into(), port: 1, local_ip: None, local_port: None };
        let b = BootstrapContact { node_id: NodeId::rand(), ip: "2.2.2.2".into(), port: 2, local_ip: None, local_port: None };
        file.save(&[a.clone(), b.clone()], Some(&b.node_id)).unwrap();
        let loaded = file.load();
        assert_eq!(loaded[0].node_id, b.node_id);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_missing_file_loads_empty() {
        let path = temp_path("missing");
        let _ = fs::remove_file(&path);
        let file = BootstrapFile::new(&path);
        assert!(file.load().is_empty());
    }

    #[test]
    fn test_corrupt_file_loads_empty() {
        let path = temp_path("corrupt");
        fs::write(&path, b"not a valid record stream at all, much too short header").unwrap();
        let file = BootstrapFile::new(&path);
        assert!(file.load().is_empty());
        let _ = fs::remove_file(&path);
    }
}
