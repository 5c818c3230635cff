//! Xen backend driving the `xl` and `xenstore-*` command line tools.
//!
//! Output parsing is kept in free functions so it can be tested without a
//! running hypervisor.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

use error_stack::{report, ResultExt};
use membal::{BackendError, DomainId, DomainInfo, DomainStore, Hypervisor, Result, MIB};

const XENTOP: &str = "xentop";
const XENSTORE_READ: &str = "xenstore-read";
const XENSTORE_WRITE: &str = "xenstore-write";

fn run(program: &Path, args: &[String]) -> std::io::Result<Output> {
    tracing::trace!(program = %program.display(), ?args, "exec");
    Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
}

fn failure_reason(program: &Path, args: &[String], output: &Output) -> String {
    format!(
        "{} {} exited with {}: {}",
        program.display(),
        args.join(" "),
        output.status,
        String::from_utf8_lossy(&output.stderr).trim()
    )
}

/// Hypervisor control through the `xl` toolstack.
///
/// `xl list` only reports whole MiB, so resident memory is taken from
/// `xentop` in KiB and matched to domain ids by name.
#[derive(Debug, Clone)]
pub struct XlHypervisor {
    xl: PathBuf,
    xentop: PathBuf,
}

impl XlHypervisor {
    pub fn new(xl: impl Into<PathBuf>) -> Self {
        Self {
            xl: xl.into(),
            xentop: PathBuf::from(XENTOP),
        }
    }

    fn exec(program: &Path, args: &[String]) -> Result<String, BackendError> {
        let output = run(program, args).change_context_lazy(|| {
            BackendError::hypervisor(format!("failed to run {}", program.display()))
        })?;
        if !output.status.success() {
            return Err(report!(BackendError::hypervisor(failure_reason(
                program, args, &output
            ))));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn xl(&self, args: &[String]) -> Result<String, BackendError> {
        Self::exec(&self.xl, args)
    }

    /// Resident memory per domain name, in bytes.
    fn resident_memory(&self) -> Result<HashMap<String, u64>, BackendError> {
        let args = ["-b", "-f", "-i", "1"].map(String::from);
        let output = Self::exec(&self.xentop, &args)?;
        parse_xentop(&output).map_err(|reason| report!(BackendError::hypervisor(reason)))
    }

    fn info_field(&self, key: &str) -> Result<u64, BackendError> {
        let info = self.xl(&["info".to_string()])?;
        parse_xl_info(&info, key)
            .ok_or_else(|| report!(BackendError::hypervisor(format!("xl info has no {key}"))))
    }

    fn set_memory(&self, command: &str, domain: DomainId, kib: u64) -> Result<(), BackendError> {
        self.xl(&[command.to_string(), domain.to_string(), format!("{kib}k")])
            .map(|_| ())
    }
}

impl Hypervisor for XlHypervisor {
    fn list_domains(&self) -> Result<Vec<DomainInfo>, BackendError> {
        let listing = self.xl(&["list".to_string()])?;
        let listed =
            parse_xl_list(&listing).map_err(|reason| report!(BackendError::hypervisor(reason)))?;
        let resident = match self.resident_memory() {
            Ok(resident) => resident,
            Err(e) => {
                tracing::warn!("falling back to MiB granularity of xl list: {e:?}");
                HashMap::new()
            }
        };

        Ok(listed
            .into_iter()
            .map(|(name, mut info)| {
                if let Some(&bytes) = resident.get(&name) {
                    info.memory_actual = bytes;
                }
                info
            })
            .collect())
    }

    fn free_memory(&self) -> Result<u64, BackendError> {
        self.info_field("free_memory")
    }

    fn total_physical_memory(&self) -> Result<u64, BackendError> {
        self.info_field("total_memory")
    }

    fn set_max(&self, domain: DomainId, max_kib: u64) -> Result<(), BackendError> {
        self.set_memory("mem-max", domain, max_kib)
    }

    fn set_target(&self, domain: DomainId, target_kib: u64) -> Result<(), BackendError> {
        self.set_memory("mem-set", domain, target_kib)
    }
}

/// Parses `xl list` output into domain names, ids and resident memory.
///
/// Columns are `Name ID Mem VCPUs State Time(s)` with memory in MiB.
pub fn parse_xl_list(output: &str) -> core::result::Result<Vec<(String, DomainInfo)>, String> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty() && !line.starts_with("Name"))
        .map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let (Some(id), Some(mem)) = (fields.get(1), fields.get(2)) else {
                return Err(format!("malformed xl list line: {line:?}"));
            };
            let id: DomainId = id
                .parse()
                .map_err(|_| format!("invalid domain id in xl list line: {line:?}"))?;
            let mib: u64 = mem
                .parse()
                .map_err(|_| format!("invalid memory in xl list line: {line:?}"))?;
            let info = DomainInfo {
                id,
                memory_actual: mib * MIB,
            };
            Ok((fields[0].to_string(), info))
        })
        .collect()
}

/// Parses batch mode `xentop` output into resident memory per domain name,
/// in bytes. The `MEM(k)` column is located through the header line.
pub fn parse_xentop(output: &str) -> core::result::Result<HashMap<String, u64>, String> {
    let mut lines = output.lines().filter(|line| !line.trim().is_empty());
    let column = lines
        .next()
        .and_then(|header| {
            header
                .split_whitespace()
                .position(|field| field == "MEM(k)")
        })
        .ok_or_else(|| "xentop output has no MEM(k) column".to_string())?;

    lines
        .map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let (Some(name), Some(mem)) = (fields.first(), fields.get(column)) else {
                return Err(format!("malformed xentop line: {line:?}"));
            };
            let kib: u64 = mem
                .parse()
                .map_err(|_| format!("invalid memory in xentop line: {line:?}"))?;
            Ok((name.to_string(), kib * 1024))
        })
        .collect()
}

/// Reads a MiB valued `key : value` field of `xl info` output, in bytes.
pub fn parse_xl_info(output: &str, key: &str) -> Option<u64> {
    output.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name.trim() != key {
            return None;
        }
        value.trim().parse::<u64>().ok().map(|mib| mib * MIB)
    })
}

/// Parses a KiB value as stored in xenstore, in bytes.
pub fn parse_kib(value: &str) -> Option<u64> {
    value.trim().parse::<u64>().ok().map(|kib| kib * 1024)
}

/// Per-domain store backed by xenstore.
#[derive(Debug, Clone)]
pub struct XenStore {
    read: PathBuf,
    write: PathBuf,
}

impl Default for XenStore {
    fn default() -> Self {
        Self {
            read: PathBuf::from(XENSTORE_READ),
            write: PathBuf::from(XENSTORE_WRITE),
        }
    }
}

impl XenStore {
    fn domain_path(domain: DomainId, key: &str) -> String {
        format!("/local/domain/{domain}/{key}")
    }

    /// Reads a key; a missing key reads as `None`.
    fn read(&self, domain: DomainId, key: &str) -> Result<Option<String>, BackendError> {
        let args = [Self::domain_path(domain, key)];
        let output = run(&self.read, &args).change_context_lazy(|| {
            BackendError::store(format!("failed to run {}", self.read.display()))
        })?;
        if !output.status.success() {
            tracing::trace!("{}", failure_reason(&self.read, &args, &output));
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&output.stdout).trim_end().to_string()))
    }
}

impl DomainStore for XenStore {
    fn static_max(&self, domain: DomainId) -> Result<Option<u64>, BackendError> {
        match self.read(domain, "memory/static-max")? {
            Some(value) => parse_kib(&value).map(Some).ok_or_else(|| {
                report!(BackendError::store(format!(
                    "invalid static-max of domain {domain}: {value:?}"
                )))
            }),
            None => Ok(None),
        }
    }

    fn write_target(&self, domain: DomainId, target_kib: u64) -> Result<(), BackendError> {
        let args = [
            Self::domain_path(domain, "memory/target"),
            target_kib.to_string(),
        ];
        let output = run(&self.write, &args).change_context_lazy(|| {
            BackendError::store(format!("failed to run {}", self.write.display()))
        })?;
        if !output.status.success() {
            return Err(report!(BackendError::store(failure_reason(
                &self.write,
                &args,
                &output
            ))));
        }
        Ok(())
    }

    fn domain_name(&self, domain: DomainId) -> Result<Option<String>, BackendError> {
        self.read(domain, "name")
    }

    fn read_meminfo(&self, domain: DomainId) -> Result<Option<String>, BackendError> {
        self.read(domain, "memory/meminfo")
    }
}
