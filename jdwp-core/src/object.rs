// ObjectReference command implementations
//
// Commands for working with object instances

use serde::{Deserialize, Serialize};

use crate::codec::{JdwpDecode, JdwpReader};
use crate::commands::{command_sets, object_reference_commands};
use crate::protocol::JdwpResult;
use crate::session::Session;
use crate::types::{FieldId, ObjectId, ReferenceTypeId, TypeTag, Value};

/// Runtime type of an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectType {
    pub ref_type_tag: TypeTag,
    pub type_id: ReferenceTypeId,
}

impl JdwpDecode for ObjectType {
    fn decode(r: &mut JdwpReader<'_>) -> JdwpResult<Self> {
        Ok(ObjectType {
            ref_type_tag: r.get()?,
            type_id: r.get()?,
        })
    }
}

impl Session {
    /// Get the reference type (class) of an object (ObjectReference.ReferenceType command)
    pub async fn get_object_reference_type(&self, object_id: ObjectId) -> JdwpResult<ObjectType> {
        self.send_command(
            command_sets::OBJECT_REFERENCE,
            object_reference_commands::REFERENCE_TYPE,
            &object_id,
        )
        .await
    }

    /// Get field values from an object (ObjectReference.GetValues command).
    /// Values come back in the order the fields were asked for.
    pub async fn get_object_values(
        &self,
        object_id: ObjectId,
        field_ids: &[FieldId],
    ) -> JdwpResult<Vec<Value>> {
        self.send_command(
            command_sets::OBJECT_REFERENCE,
            object_reference_commands::GET_VALUES,
            &(object_id, field_ids),
        )
        .await
    }
}
