// Event objects handed to request handlers
//
// Wraps a decoded EventResponse and resolves the mirrors it refers to
// (thread, location, field, object) on demand. Every accessor issues its
// RPCs at most once per event; later calls return the cached result.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::OnceCell;

use crate::events::{EventKind, EventResponse};
use crate::object::ObjectType;
use crate::protocol::{error_name, JdwpError, JdwpResult};
use crate::reftype::{FieldInfo, MethodInfo};
use crate::session::{Session, WeakSession};
use crate::types::{
    FieldId, Location, ObjectId, ReferenceTypeId, Tag, TaggedObjectId, ThreadId, TypeTag, Value,
};

const INVALID_METHODID: u16 = 23;
const INVALID_FIELDID: u16 = 25;
const ABSENT_INFORMATION: u16 = 101;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThreadRef {
    pub id: ThreadId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TypeRef {
    pub id: ReferenceTypeId,
    pub signature: String,
}

impl TypeRef {
    pub fn name(&self) -> String {
        signature_to_name(&self.signature)
    }
}

/// A location with its declaring type and method resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedLocation {
    pub location: Location,
    pub declaring_type: TypeRef,
    pub method: MethodInfo,
    pub code_index: u64,
}

impl fmt::Display for ResolvedLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}{}@{}",
            self.declaring_type.name(),
            self.method.name,
            self.method.signature,
            self.code_index
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldRef {
    pub declaring_type: ReferenceTypeId,
    pub field: FieldInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectRef {
    pub id: ObjectId,
    pub tag: Tag,
    pub ref_type_tag: TypeTag,
    pub type_id: ReferenceTypeId,
}

struct EventInner {
    session: WeakSession,
    response: EventResponse,
    thread: OnceCell<ThreadRef>,
    location: OnceCell<ResolvedLocation>,
    line_number: OnceCell<Option<i32>>,
    field: OnceCell<FieldRef>,
    object: OnceCell<Option<ObjectRef>>,
    current_value: OnceCell<Value>,
}

/// One event, as seen by a handler. Cheap to clone; clones share caches.
#[derive(Clone)]
pub struct EventObject {
    inner: Arc<EventInner>,
}

impl fmt::Debug for EventObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventObject")
            .field("response", &self.inner.response)
            .finish_non_exhaustive()
    }
}

impl EventObject {
    pub(crate) fn new(session: WeakSession, response: EventResponse) -> Self {
        Self {
            inner: Arc::new(EventInner {
                session,
                response,
                thread: OnceCell::new(),
                location: OnceCell::new(),
                line_number: OnceCell::new(),
                field: OnceCell::new(),
                object: OnceCell::new(),
                current_value: OnceCell::new(),
            }),
        }
    }

    pub fn response(&self) -> &EventResponse {
        &self.inner.response
    }

    pub fn kind(&self) -> EventKind {
        self.inner.response.kind()
    }

    pub fn request_id(&self) -> i32 {
        self.inner.response.request_id()
    }

    fn session(&self) -> JdwpResult<Session> {
        self.inner.session.upgrade()
    }

    /// The event's thread with its name. One ThreadReference.Name call.
    pub async fn thread(&self) -> JdwpResult<Option<ThreadRef>> {
        let Some(id) = self.inner.response.thread() else {
            return Ok(None);
        };
        let thread = self
            .inner
            .thread
            .get_or_try_init(|| async {
                let name = self.session()?.get_thread_name(id).await?;
                Ok::<_, JdwpError>(ThreadRef { id, name })
            })
            .await?;
        Ok(Some(thread.clone()))
    }

    /// The event's location with declaring type and method resolved.
    /// One ReferenceType.Signature call followed by one ReferenceType.Methods call.
    pub async fn location(&self) -> JdwpResult<Option<ResolvedLocation>> {
        let Some(location) = self.inner.response.location().copied() else {
            return Ok(None);
        };
        let resolved = self
            .inner
            .location
            .get_or_try_init(|| resolve_location(self.session(), location))
            .await?;
        Ok(Some(resolved.clone()))
    }

    pub async fn method(&self) -> JdwpResult<Option<MethodInfo>> {
        Ok(self.location().await?.map(|resolved| resolved.method))
    }

    /// Source line of the event's location. `None` when the class was
    /// compiled without line information.
    pub async fn line_number(&self) -> JdwpResult<Option<i32>> {
        let Some(location) = self.inner.response.location().copied() else {
            return Ok(None);
        };
        let line = self
            .inner
            .line_number
            .get_or_try_init(|| async {
                let session = self.session()?;
                match session
                    .get_line_table(location.class_id, location.method_id)
                    .await
                {
                    Ok(table) => Ok(table.line_for_index(location.index)),
                    Err(e) if e.error_code() == Some(ABSENT_INFORMATION) => Ok(None),
                    Err(e) => Err::<_, JdwpError>(e),
                }
            })
            .await?;
        Ok(*line)
    }

    /// The prepared type of a class prepare event. No RPC.
    pub fn reference_type(&self) -> Option<TypeRef> {
        match &self.inner.response {
            EventResponse::ClassPrepare {
                type_id, signature, ..
            } => Some(TypeRef {
                id: *type_id,
                signature: signature.clone(),
            }),
            _ => None,
        }
    }

    /// The watched field. One ReferenceType.Fields call on its declaring type.
    pub async fn field(&self) -> JdwpResult<Option<FieldRef>> {
        let Some((declaring_type, field_id)) = self.watched_field() else {
            return Ok(None);
        };
        let field = self
            .inner
            .field
            .get_or_try_init(|| async {
                let fields = self.session()?.get_fields(declaring_type).await?;
                fields
                    .into_iter()
                    .find(|f| f.field_id == field_id)
                    .map(|field| FieldRef {
                        declaring_type,
                        field,
                    })
                    .ok_or_else(|| invalid_id(INVALID_FIELDID))
            })
            .await?;
        Ok(Some(field.clone()))
    }

    /// The object whose field was accessed or modified. `None` for static fields.
    pub async fn object(&self) -> JdwpResult<Option<ObjectRef>> {
        match &self.inner.response {
            EventResponse::FieldAccess { object, .. }
            | EventResponse::FieldModification { object, .. } => {
                self.resolve_object(*object).await
            }
            _ => Ok(None),
        }
    }

    /// The thrown exception. One ObjectReference.ReferenceType call.
    pub async fn exception(&self) -> JdwpResult<Option<ObjectRef>> {
        match &self.inner.response {
            EventResponse::Exception { exception, .. } => self.resolve_object(*exception).await,
            _ => Ok(None),
        }
    }

    async fn resolve_object(&self, tagged: TaggedObjectId) -> JdwpResult<Option<ObjectRef>> {
        if tagged.id.is_null() {
            return Ok(None);
        }
        let object = self
            .inner
            .object
            .get_or_try_init(|| async {
                let ObjectType {
                    ref_type_tag,
                    type_id,
                } = self.session()?.get_object_reference_type(tagged.id).await?;
                Ok::<_, JdwpError>(Some(ObjectRef {
                    id: tagged.id,
                    tag: tagged.tag,
                    ref_type_tag,
                    type_id,
                }))
            })
            .await?;
        Ok(object.clone())
    }

    /// Current value of the watched field, read from the target.
    pub async fn current_value(&self) -> JdwpResult<Option<Value>> {
        let Some((declaring_type, field_id)) = self.watched_field() else {
            return Ok(None);
        };
        let object = match &self.inner.response {
            EventResponse::FieldAccess { object, .. }
            | EventResponse::FieldModification { object, .. } => object.id,
            _ => return Ok(None),
        };
        let value = self
            .inner
            .current_value
            .get_or_try_init(|| async {
                let session = self.session()?;
                let values = if object.is_null() {
                    session
                        .get_static_values(declaring_type, &[field_id])
                        .await?
                } else {
                    session.get_object_values(object, &[field_id]).await?
                };
                values
                    .into_iter()
                    .next()
                    .ok_or_else(|| JdwpError::decode("GetValues returned no value"))
            })
            .await?;
        Ok(Some(*value))
    }

    /// Return value of a method exit event, if the request asked for one.
    pub fn return_value(&self) -> Option<Value> {
        match &self.inner.response {
            EventResponse::MethodExit { return_value, .. } => *return_value,
            _ => None,
        }
    }

    /// The value about to be stored by a field modification.
    pub fn value_to_be(&self) -> Option<Value> {
        match &self.inner.response {
            EventResponse::FieldModification { value_to_be, .. } => Some(*value_to_be),
            _ => None,
        }
    }

    /// Signature of the class a class prepare or unload event is about.
    pub fn class_signature(&self) -> Option<&str> {
        match &self.inner.response {
            EventResponse::ClassPrepare { signature, .. }
            | EventResponse::ClassUnload { signature, .. } => Some(signature),
            _ => None,
        }
    }

    pub fn class_name(&self) -> Option<String> {
        self.class_signature().map(signature_to_name)
    }

    fn watched_field(&self) -> Option<(ReferenceTypeId, FieldId)> {
        match &self.inner.response {
            EventResponse::FieldAccess {
                type_id, field_id, ..
            }
            | EventResponse::FieldModification {
                type_id, field_id, ..
            } => Some((*type_id, *field_id)),
            _ => None,
        }
    }
}

async fn resolve_location(
    session: JdwpResult<Session>,
    location: Location,
) -> JdwpResult<ResolvedLocation> {
    let session = session?;
    let signature = session.get_type_signature(location.class_id).await?;
    let methods = session.get_methods(location.class_id).await?;
    let method = methods
        .into_iter()
        .find(|m| m.method_id == location.method_id)
        .ok_or_else(|| invalid_id(INVALID_METHODID))?;

    Ok(ResolvedLocation {
        location,
        declaring_type: TypeRef {
            id: location.class_id,
            signature,
        },
        method,
        code_index: location.index,
    })
}

fn invalid_id(code: u16) -> JdwpError {
    JdwpError::JdwpErrorCode(code, error_name(code).to_string())
}

/// Convert a JNI type signature to a Java type name.
///
/// `Ljava/lang/String;` becomes `java.lang.String`, `[I` becomes `int[]`.
pub fn signature_to_name(signature: &str) -> String {
    let dims = signature.chars().take_while(|c| *c == '[').count();
    let element = &signature[dims..];
    let mut name = match element {
        "Z" => "boolean".to_string(),
        "B" => "byte".to_string(),
        "C" => "char".to_string(),
        "S" => "short".to_string(),
        "I" => "int".to_string(),
        "J" => "long".to_string(),
        "F" => "float".to_string(),
        "D" => "double".to_string(),
        "V" => "void".to_string(),
        _ => element
            .strip_prefix('L')
            .and_then(|s| s.strip_suffix(';'))
            .unwrap_or(element)
            .replace('/', "."),
    };
    for _ in 0..dims {
        name.push_str("[]");
    }
    name
}
