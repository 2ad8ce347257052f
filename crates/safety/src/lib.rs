use multiboot_core::DiskRecord;
use std::io::{BufRead, Write};
use tracing::{debug, info};
use uuid::Uuid;

/// The literal an operator must type before anything is erased.
pub const CONFIRMATION_TOKEN: &str = "ERASE";

pub const EXTERNAL_PROTOCOLS: &[&str] = &["usb", "thunderbolt", "firewire", "secure digital", "sd", "mmc"];

pub const SYSTEM_MOUNT_POINTS: &[&str] = &["/", "/System", "/Library", "/private", "/Users"];

/// Facts about the running system the filter needs. Passed in explicitly so
/// tests can use synthetic boot disks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafetyContext {
    pub boot_disk_id: String,
}

impl SafetyContext {
    pub fn new(boot_disk_id: impl Into<String>) -> Self {
        Self {
            boot_disk_id: boot_disk_id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SafetyDecision {
    Allow,
    Deny(String),
}

impl SafetyDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, SafetyDecision::Allow)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("disk {disk_id} is not an eligible target: {reason}")]
pub struct DiskIneligible {
    pub disk_id: String,
    pub reason: String,
}

pub fn evaluate_disk(ctx: &SafetyContext, disk: &DiskRecord) -> SafetyDecision {
    let Some(number) = disk.disk_number() else {
        return SafetyDecision::Deny(format!("'{}' is not a whole-disk identifier", disk.id));
    };
    if disk.id == ctx.boot_disk_id || disk.is_boot_disk {
        return SafetyDecision::Deny("this is the boot disk".to_string());
    }
    if number < 2 {
        return SafetyDecision::Deny(format!("{} is never a safe target", disk.id));
    }

    if !is_external_protocol(&disk.protocol) {
        return SafetyDecision::Deny(format!(
            "bus protocol '{}' is not an external transport",
            disk.protocol
        ));
    }
    if disk.internal {
        return SafetyDecision::Deny("disk reports itself as internal".to_string());
    }
    if disk.virtual_disk {
        return SafetyDecision::Deny("disk is a virtual disk image".to_string());
    }

    if let Some(mount) = disk.mount_points().find(|mount| is_system_mount(mount)) {
        return SafetyDecision::Deny(format!("volume mounted at {mount} belongs to the running system"));
    }

    SafetyDecision::Allow
}

/// Keeps only disks every rule allows, in enumeration order.
pub fn filter_safe_disks(ctx: &SafetyContext, disks: &[DiskRecord]) -> Vec<DiskRecord> {
    disks
        .iter()
        .filter(|disk| match evaluate_disk(ctx, disk) {
            SafetyDecision::Allow => true,
            SafetyDecision::Deny(reason) => {
                debug!(disk_id = %disk.id, %reason, "excluding disk");
                false
            }
        })
        .cloned()
        .collect()
}

pub fn ensure_eligible(ctx: &SafetyContext, disk: &DiskRecord) -> Result<(), DiskIneligible> {
    match evaluate_disk(ctx, disk) {
        SafetyDecision::Allow => Ok(()),
        SafetyDecision::Deny(reason) => Err(DiskIneligible {
            disk_id: disk.id.clone(),
            reason,
        }),
    }
}

pub fn is_external_protocol(protocol: &str) -> bool {
    let protocol = protocol.trim().to_ascii_lowercase();
    EXTERNAL_PROTOCOLS.contains(&protocol.as_str())
}

pub fn is_system_mount(mount_point: &str) -> bool {
    let trimmed = if mount_point.len() > 1 {
        mount_point.trim_end_matches('/')
    } else {
        mount_point
    };
    SYSTEM_MOUNT_POINTS.contains(&trimmed) || trimmed.starts_with("/System/Volumes/")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    AwaitingInput,
    Confirmed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GateError {
    #[error("confirmation for {disk_id} was already decided ({state:?})")]
    AlreadyDecided { disk_id: String, state: GateState },
    #[error("confirmation rejected for {disk_id}: destructive operation cancelled")]
    Rejected { disk_id: String },
}

/// Proof that an operator confirmed erasing one specific disk. Only
/// [`ConfirmationGate`] can produce one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authorization {
    run_id: Uuid,
    disk_id: String,
}

impl Authorization {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn disk_id(&self) -> &str {
        &self.disk_id
    }
}

/// Single-decision checkpoint between plan computation and execution.
#[derive(Debug)]
pub struct ConfirmationGate {
    disk_id: String,
    state: GateState,
}

impl ConfirmationGate {
    pub fn new(disk_id: impl Into<String>) -> Self {
        Self {
            disk_id: disk_id.into(),
            state: GateState::AwaitingInput,
        }
    }

    pub fn state(&self) -> GateState {
        self.state
    }

    pub fn disk_id(&self) -> &str {
        &self.disk_id
    }

    /// Accepts exactly one answer. Only the line terminator is stripped; the
    /// rest must equal `ERASE` byte for byte.
    pub fn submit(&mut self, input: &str) -> Result<GateState, GateError> {
        if self.state != GateState::AwaitingInput {
            return Err(GateError::AlreadyDecided {
                disk_id: self.disk_id.clone(),
                state: self.state,
            });
        }
        let answer = strip_line_terminator(input);
        self.state = if answer == CONFIRMATION_TOKEN {
            GateState::Confirmed
        } else {
            GateState::Cancelled
        };
        info!(disk_id = %self.disk_id, state = ?self.state, "confirmation decided");
        Ok(self.state)
    }

    pub fn authorization(&self) -> Result<Authorization, GateError> {
        match self.state {
            GateState::Confirmed => Ok(Authorization {
                run_id: Uuid::new_v4(),
                disk_id: self.disk_id.clone(),
            }),
            _ => Err(GateError::Rejected {
                disk_id: self.disk_id.clone(),
            }),
        }
    }
}

fn strip_line_terminator(input: &str) -> &str {
    let input = input.strip_suffix('\n').unwrap_or(input);
    input.strip_suffix('\r').unwrap_or(input)
}

/// Prompts once and reads one line. End of input cancels.
pub fn request_confirmation<R: BufRead, W: Write>(
    reader: &mut R,
    writer: &mut W,
    disk: &DiskRecord,
) -> std::io::Result<Result<Authorization, GateError>> {
    let mut gate = ConfirmationGate::new(disk.id.clone());
    writeln!(
        writer,
        "ALL DATA on {} ({}, {} bytes) will be erased.",
        disk.id, disk.label, disk.capacity_bytes
    )?;
    write!(writer, "Type {CONFIRMATION_TOKEN} to continue: ")?;
    writer.flush()?;

    let mut line = String::new();
    reader.read_line(&mut line)?;
    if let Err(err) = gate.submit(&line) {
        return Ok(Err(err));
    }
    Ok(gate.authorization())
}

#[cfg(test)]
mod tests {
    use super::*;
    use multiboot_core::VolumeRecord;

    fn usb_disk(id: &str) -> DiskRecord {
        DiskRecord {
            id: id.to_string(),
            label: "Samsung BAR".to_string(),
            capacity_bytes: 64_000_000_000,
            protocol: "USB".to_string(),
            removable: true,
            internal: false,
            virtual_disk: false,
            is_boot_disk: false,
            volumes: vec![],
        }
    }

    fn ctx() -> SafetyContext {
        SafetyContext::new("disk3")
    }

    #[test]
    fn allows_plain_usb_stick() {
        assert_eq!(evaluate_disk(&ctx(), &usb_disk("disk4")), SafetyDecision::Allow);
    }

    #[test]
    fn denies_boot_and_low_numbered_disks() {
        assert!(!evaluate_disk(&ctx(), &usb_disk("disk3")).is_allowed());
        assert!(!evaluate_disk(&ctx(), &usb_disk("disk0")).is_allowed());
        assert!(!evaluate_disk(&ctx(), &usb_disk("disk1")).is_allowed());
        let mut flagged = usb_disk("disk7");
        flagged.is_boot_disk = true;
        assert!(!evaluate_disk(&ctx(), &flagged).is_allowed());
    }

    #[test]
    fn denies_ambiguous_identifiers() {
        assert!(!evaluate_disk(&ctx(), &usb_disk("disk4s1")).is_allowed());
        assert!(!evaluate_disk(&ctx(), &usb_disk("")).is_allowed());
    }

    #[test]
    fn denies_non_external_transports() {
        for protocol in ["PCI-Express", "SATA", "Apple Fabric", "Disk Image", ""] {
            let mut disk = usb_disk("disk5");
            disk.protocol = protocol.to_string();
            assert!(
                !evaluate_disk(&ctx(), &disk).is_allowed(),
                "{protocol} should be denied"
            );
        }
        let mut sd = usb_disk("disk5");
        sd.protocol = "Secure Digital".to_string();
        assert!(evaluate_disk(&ctx(), &sd).is_allowed());
    }

    #[test]
    fn denies_internal_and_virtual_flags() {
        let mut internal = usb_disk("disk5");
        internal.internal = true;
        assert!(!evaluate_disk(&ctx(), &internal).is_allowed());
        let mut image = usb_disk("disk6");
        image.virtual_disk = true;
        assert!(!evaluate_disk(&ctx(), &image).is_allowed());
    }

    #[test]
    fn denies_disk_with_system_volume_mounted() {
        let mut disk = usb_disk("disk5");
        disk.volumes.push(VolumeRecord {
            id: "disk5s2".to_string(),
            name: Some("Data".to_string()),
            mount_point: Some("/System/Volumes/Data".to_string()),
            size_bytes: 1,
        });
        assert!(matches!(evaluate_disk(&ctx(), &disk), SafetyDecision::Deny(reason) if reason.contains("/System/Volumes/Data")));
    }

    #[test]
    fn user_volumes_are_not_system_mounts() {
        assert!(is_system_mount("/"));
        assert!(is_system_mount("/Library/"));
        assert!(is_system_mount("/System/Volumes/Preboot"));
        assert!(!is_system_mount("/Volumes/USB"));
        assert!(!is_system_mount("/Systematic"));
    }

    #[test]
    fn filter_never_returns_boot_disk_in_any_order() {
        let disks = vec![usb_disk("disk3"), usb_disk("disk4"), usb_disk("disk0"), usb_disk("disk9")];
        let mut order = disks.clone();
        for _ in 0..order.len() {
            order.rotate_left(1);
            let safe = filter_safe_disks(&ctx(), &order);
            assert!(safe.iter().all(|disk| disk.id != "disk3"));
            assert_eq!(safe.len(), 2);
        }
        let mut reversed = disks;
        reversed.reverse();
        let ids: Vec<_> = filter_safe_disks(&ctx(), &reversed)
            .into_iter()
            .map(|disk| disk.id)
            .collect();
        assert_eq!(ids, vec!["disk9", "disk4"]);
    }

    #[test]
    fn ensure_eligible_carries_reason() {
        let err = ensure_eligible(&ctx(), &usb_disk("disk3")).expect_err("boot disk");
        assert_eq!(err.disk_id, "disk3");
        assert!(err.to_string().contains("boot disk"));
    }

    #[test]
    fn gate_confirms_only_exact_token() {
        for (input, expected) in [
            ("ERASE", GateState::Confirmed),
            ("ERASE\n", GateState::Confirmed),
            ("ERASE\r\n", GateState::Confirmed),
            ("erase", GateState::Cancelled),
            ("ERASE ", GateState::Cancelled),
            (" ERASE", GateState::Cancelled),
            ("yes", GateState::Cancelled),
            ("", GateState::Cancelled),
        ] {
            let mut gate = ConfirmationGate::new("disk4");
            assert_eq!(gate.submit(input), Ok(expected), "input {input:?}");
        }
    }

    #[test]
    fn gate_accepts_a_single_transition() {
        let mut gate = ConfirmationGate::new("disk4");
        assert_eq!(gate.submit("no"), Ok(GateState::Cancelled));
        assert!(matches!(
            gate.submit("ERASE"),
            Err(GateError::AlreadyDecided { .. })
        ));
        assert_eq!(gate.state(), GateState::Cancelled);
        assert!(gate.authorization().is_err());
    }

    #[test]
    fn authorization_is_bound_to_disk() {
        let mut gate = ConfirmationGate::new("disk4");
        assert!(gate.authorization().is_err());
        gate.submit("ERASE").expect("first answer");
        let auth = gate.authorization().expect("confirmed");
        assert_eq!(auth.disk_id(), "disk4");
    }

    #[test]
    fn prompt_reads_one_line() {
        let disk = usb_disk("disk4");
        let mut input = "ERASE\nERASE\n".as_bytes();
        let mut output = Vec::new();
        let auth = request_confirmation(&mut input, &mut output, &disk)
            .expect("io")
            .expect("confirmed");
        assert_eq!(auth.disk_id(), "disk4");
        let prompt = String::from_utf8(output).expect("utf8");
        assert!(prompt.contains("Type ERASE to continue"));

        let mut eof = "".as_bytes();
        let mut sink = Vec::new();
        let rejected = request_confirmation(&mut eof, &mut sink, &disk).expect("io");
        assert!(matches!(rejected, Err(GateError::Rejected { .. })));
    }
}
