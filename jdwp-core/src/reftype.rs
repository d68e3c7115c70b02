// ReferenceType command implementations
//
// Commands for working with classes, interfaces, and arrays

use serde::{Deserialize, Serialize};

use crate::codec::{JdwpDecode, JdwpReader};
use crate::commands::{command_sets, reference_type_commands};
use crate::protocol::JdwpResult;
use crate::session::Session;
use crate::types::{FieldId, MethodId, ReferenceTypeId, Value};

/// Method information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodInfo {
    pub method_id: MethodId,
    pub name: String,
    pub signature: String,
    pub mod_bits: i32,
}

impl JdwpDecode for MethodInfo {
    fn decode(r: &mut JdwpReader<'_>) -> JdwpResult<Self> {
        Ok(MethodInfo {
            method_id: r.get()?,
            name: r.get_string()?,
            signature: r.get_string()?,
            mod_bits: r.get_i32()?,
        })
    }
}

/// Field information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldInfo {
    pub field_id: FieldId,
    pub name: String,
    pub signature: String,
    pub mod_bits: i32,
}

impl JdwpDecode for FieldInfo {
    fn decode(r: &mut JdwpReader<'_>) -> JdwpResult<Self> {
        Ok(FieldInfo {
            field_id: r.get()?,
            name: r.get_string()?,
            signature: r.get_string()?,
            mod_bits: r.get_i32()?,
        })
    }
}

impl Session {
    /// JNI signature of a reference type (ReferenceType.Signature)
    pub async fn get_type_signature(&self, ref_type_id: ReferenceTypeId) -> JdwpResult<String> {
        self.send_command(
            command_sets::REFERENCE_TYPE,
            reference_type_commands::SIGNATURE,
            &ref_type_id,
        )
        .await
    }

    /// Get fields declared by a reference type (ReferenceType.Fields)
    pub async fn get_fields(&self, ref_type_id: ReferenceTypeId) -> JdwpResult<Vec<FieldInfo>> {
        self.send_command(
            command_sets::REFERENCE_TYPE,
            reference_type_commands::FIELDS,
            &ref_type_id,
        )
        .await
    }

    /// Get methods for a reference type (ReferenceType.Methods command)
    pub async fn get_methods(&self, ref_type_id: ReferenceTypeId) -> JdwpResult<Vec<MethodInfo>> {
        self.send_command(
            command_sets::REFERENCE_TYPE,
            reference_type_commands::METHODS,
            &ref_type_id,
        )
        .await
    }

    /// Values of static fields (ReferenceType.GetValues), in request order.
    pub async fn get_static_values(
        &self,
        ref_type_id: ReferenceTypeId,
        field_ids: &[FieldId],
    ) -> JdwpResult<Vec<Value>> {
        self.send_command(
            command_sets::REFERENCE_TYPE,
            reference_type_commands::GET_VALUES,
            &(ref_type_id, field_ids),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JdwpWriter;
    use crate::testing::FakeTarget;
    use crate::types::{IdKind, IdSizes};

    #[tokio::test]
    async fn test_get_methods_decodes_with_method_width() {
        let sizes = IdSizes {
            field_id_size: 8,
            method_id_size: 4,
            object_id_size: 8,
            reference_type_id_size: 8,
            frame_id_size: 8,
        };
        let target = FakeTarget::builder()
            .id_sizes(sizes)
            .respond(
                command_sets::REFERENCE_TYPE,
                reference_type_commands::METHODS,
                |_, sizes| {
                    let mut w = JdwpWriter::new(sizes);
                    w.put_i32(2);
                    w.put_id(IdKind::Method, 1)?;
                    w.put_string("<init>");
                    w.put_string("()V");
                    w.put_i32(1);
                    w.put_id(IdKind::Method, 2)?;
                    w.put_string("run");
                    w.put_string("()V");
                    w.put_i32(1);
                    Ok(w.into_vec())
                },
            )
            .spawn();
        let session = target.attach().await.unwrap();

        let methods = session.get_methods(ReferenceTypeId(0x10)).await.unwrap();
        assert_eq!(methods.len(), 2);
        assert_eq!(methods[1].method_id, MethodId(2));
        assert_eq!(methods[1].name, "run");
    }

    #[tokio::test]
    async fn test_width_mismatch_in_reply_is_a_decode_error() {
        // Target claims 4-byte method ids but answers with 8-byte ones.
        let target = FakeTarget::builder()
            .id_sizes(IdSizes {
                method_id_size: 4,
                ..IdSizes::default()
            })
            .respond(
                command_sets::REFERENCE_TYPE,
                reference_type_commands::METHODS,
                |_, _| {
                    let mut w = JdwpWriter::new(IdSizes::default());
                    w.put_i32(1);
                    w.put_id(IdKind::Method, 1)?;
                    w.put_string("run");
                    w.put_string("()V");
                    w.put_i32(1);
                    Ok(w.into_vec())
                },
            )
            .spawn();
        let session = target.attach().await.unwrap();

        let err = session.get_methods(ReferenceTypeId(0x10)).await.unwrap_err();
        assert!(matches!(err, crate::protocol::JdwpError::Decode(_)));
        // The session itself is unaffected.
        assert!(!session.is_closed());
        assert_eq!(session.pending_count(), 0);
    }
}
