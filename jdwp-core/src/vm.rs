// VirtualMachine command implementations
//
// These are the fundamental commands for interacting with the JVM

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::codec::{JdwpDecode, JdwpReader};
use crate::commands::{command_sets, vm_commands};
use crate::protocol::JdwpResult;
use crate::session::Session;
use crate::types::{ReferenceTypeId, TypeTag};

/// JVM version information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmVersion {
    pub description: String,
    pub jdwp_major: i32,
    pub jdwp_minor: i32,
    pub vm_version: String,
    pub vm_name: String,
}

impl JdwpDecode for VmVersion {
    fn decode(r: &mut JdwpReader<'_>) -> JdwpResult<Self> {
        Ok(VmVersion {
            description: r.get_string()?,
            jdwp_major: r.get_i32()?,
            jdwp_minor: r.get_i32()?,
            vm_version: r.get_string()?,
            vm_name: r.get_string()?,
        })
    }
}

/// Class information, as listed by AllClasses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassInfo {
    pub ref_type_tag: TypeTag,
    pub type_id: ReferenceTypeId,
    pub signature: String,
    pub status: i32,
}

impl JdwpDecode for ClassInfo {
    fn decode(r: &mut JdwpReader<'_>) -> JdwpResult<Self> {
        Ok(ClassInfo {
            ref_type_tag: r.get()?,
            type_id: r.get()?,
            signature: r.get_string()?,
            status: r.get_i32()?,
        })
    }
}

// ClassesBySignature omits the signature it was asked for.
struct MatchedClass {
    ref_type_tag: TypeTag,
    type_id: ReferenceTypeId,
    status: i32,
}

impl JdwpDecode for MatchedClass {
    fn decode(r: &mut JdwpReader<'_>) -> JdwpResult<Self> {
        Ok(MatchedClass {
            ref_type_tag: r.get()?,
            type_id: r.get()?,
            status: r.get_i32()?,
        })
    }
}

/// Optional features of the target (CapabilitiesNew), in protocol order.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Capabilities {
    flags: Vec<bool>,
}

impl Capabilities {
    fn flag(&self, index: usize) -> bool {
        self.flags.get(index).copied().unwrap_or(false)
    }

    pub fn can_watch_field_modification(&self) -> bool {
        self.flag(0)
    }

    pub fn can_watch_field_access(&self) -> bool {
        self.flag(1)
    }

    pub fn can_redefine_classes(&self) -> bool {
        self.flag(7)
    }

    pub fn can_pop_frames(&self) -> bool {
        self.flag(10)
    }

    pub fn can_use_instance_filters(&self) -> bool {
        self.flag(11)
    }

    pub fn can_request_vm_death_event(&self) -> bool {
        self.flag(13)
    }

    pub fn can_get_instance_info(&self) -> bool {
        self.flag(15)
    }

    pub fn can_use_source_name_filters(&self) -> bool {
        self.flag(18)
    }

    pub fn can_force_early_return(&self) -> bool {
        self.flag(20)
    }

    pub fn as_slice(&self) -> &[bool] {
        &self.flags
    }
}

impl JdwpDecode for Capabilities {
    fn decode(r: &mut JdwpReader<'_>) -> JdwpResult<Self> {
        // 32 flags today; read whatever the target sends.
        let mut flags = Vec::with_capacity(r.remaining());
        while r.remaining() > 0 {
            flags.push(r.get_bool()?);
        }
        Ok(Capabilities { flags })
    }
}

impl Session {
    /// Get JVM version information (VirtualMachine.Version command).
    /// Fetched once per session.
    pub async fn version(&self) -> JdwpResult<VmVersion> {
        let version = self
            .inner()
            .version
            .get_or_try_init(|| {
                self.send_command(command_sets::VIRTUAL_MACHINE, vm_commands::VERSION, &())
            })
            .await?;
        Ok(version.clone())
    }

    /// VirtualMachine.CapabilitiesNew, fetched once per session.
    pub async fn capabilities(&self) -> JdwpResult<Capabilities> {
        let capabilities = self
            .inner()
            .capabilities
            .get_or_try_init(|| {
                self.send_command(
                    command_sets::VIRTUAL_MACHINE,
                    vm_commands::CAPABILITIES_NEW,
                    &(),
                )
            })
            .await?;
        Ok(capabilities.clone())
    }

    /// Find classes by signature (VirtualMachine.ClassesBySignature command)
    /// Signature format: "Lcom/example/MyClass;" for classes
    pub async fn classes_by_signature(&self, signature: &str) -> JdwpResult<Vec<ClassInfo>> {
        let matched: Vec<MatchedClass> = self
            .send_command(
                command_sets::VIRTUAL_MACHINE,
                vm_commands::CLASSES_BY_SIGNATURE,
                signature,
            )
            .await?;

        Ok(matched
            .into_iter()
            .map(|c| ClassInfo {
                ref_type_tag: c.ref_type_tag,
                type_id: c.type_id,
                signature: signature.to_string(),
                status: c.status,
            })
            .collect())
    }

    /// All loaded classes (VirtualMachine.AllClasses). While the class cache
    /// is frozen, the list is fetched once and reused.
    pub async fn all_classes(&self) -> JdwpResult<Arc<Vec<ClassInfo>>> {
        if let Some(classes) = self.inner().class_cache.cached() {
            debug!("Serving {} classes from frozen cache", classes.len());
            return Ok(classes);
        }

        let classes: Vec<ClassInfo> = self
            .send_command(command_sets::VIRTUAL_MACHINE, vm_commands::ALL_CLASSES, &())
            .await?;
        let classes = Arc::new(classes);
        self.inner().class_cache.store(classes.clone());
        Ok(classes)
    }

    /// Detach from the target (VirtualMachine.Dispose). Event requests are
    /// cancelled by the target and the session is closed.
    pub async fn dispose(&self) -> JdwpResult<()> {
        let result = self
            .exec(command_sets::VIRTUAL_MACHINE, vm_commands::DISPOSE, &())
            .await;
        self.shutdown();
        result
    }
}
