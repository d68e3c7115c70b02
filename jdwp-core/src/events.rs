// JDWP event handling
//
// Events are sent from the JVM to notify about breakpoints, steps, etc.
// They arrive bundled in composite packets (Event.Composite, 64/100); each
// event echoes the id of the request that produced it.

use serde::{Deserialize, Serialize};

use crate::codec::{JdwpDecode, JdwpEncode, JdwpReader, JdwpWriter};
use crate::commands::{event_kinds, modifier_kinds};
use crate::eventrequest::SuspendPolicy;
use crate::protocol::{JdwpError, JdwpResult};
use crate::types::*;

/// Event kinds, as used by EventRequest.Set and in composite events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EventKind {
    SingleStep = event_kinds::SINGLE_STEP,
    Breakpoint = event_kinds::BREAKPOINT,
    Exception = event_kinds::EXCEPTION,
    ThreadStart = event_kinds::THREAD_START,
    ThreadDeath = event_kinds::THREAD_DEATH,
    ClassPrepare = event_kinds::CLASS_PREPARE,
    ClassUnload = event_kinds::CLASS_UNLOAD,
    FieldAccess = event_kinds::FIELD_ACCESS,
    FieldModification = event_kinds::FIELD_MODIFICATION,
    ExceptionCatch = event_kinds::EXCEPTION_CATCH,
    MethodEntry = event_kinds::METHOD_ENTRY,
    MethodExit = event_kinds::METHOD_EXIT,
    MethodExitWithReturnValue = event_kinds::METHOD_EXIT_WITH_RETURN_VALUE,
    VmStart = event_kinds::VM_START,
    VmDeath = event_kinds::VM_DEATH,
}

impl TryFrom<u8> for EventKind {
    type Error = JdwpError;

    fn try_from(v: u8) -> JdwpResult<Self> {
        Ok(match v {
            event_kinds::SINGLE_STEP => EventKind::SingleStep,
            event_kinds::BREAKPOINT => EventKind::Breakpoint,
            event_kinds::EXCEPTION => EventKind::Exception,
            event_kinds::THREAD_START => EventKind::ThreadStart,
            event_kinds::THREAD_DEATH => EventKind::ThreadDeath,
            event_kinds::CLASS_PREPARE => EventKind::ClassPrepare,
            event_kinds::CLASS_UNLOAD => EventKind::ClassUnload,
            event_kinds::FIELD_ACCESS => EventKind::FieldAccess,
            event_kinds::FIELD_MODIFICATION => EventKind::FieldModification,
            event_kinds::EXCEPTION_CATCH => EventKind::ExceptionCatch,
            event_kinds::METHOD_ENTRY => EventKind::MethodEntry,
            event_kinds::METHOD_EXIT => EventKind::MethodExit,
            event_kinds::METHOD_EXIT_WITH_RETURN_VALUE => EventKind::MethodExitWithReturnValue,
            event_kinds::VM_START => EventKind::VmStart,
            event_kinds::VM_DEATH => EventKind::VmDeath,
            _ => return Err(JdwpError::decode(format!("Unknown event kind: {}", v))),
        })
    }
}

impl JdwpEncode for EventKind {
    fn encode(&self, w: &mut JdwpWriter) -> JdwpResult<()> {
        w.put_u8(*self as u8);
        Ok(())
    }
}

impl JdwpDecode for EventKind {
    fn decode(r: &mut JdwpReader<'_>) -> JdwpResult<Self> {
        EventKind::try_from(r.get_u8()?)
    }
}

/// Composite event packet (can contain multiple events)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventSet {
    pub suspend_policy: SuspendPolicy,
    pub events: Vec<EventResponse>,
}

impl JdwpDecode for EventSet {
    fn decode(r: &mut JdwpReader<'_>) -> JdwpResult<Self> {
        Ok(EventSet {
            suspend_policy: r.get()?,
            events: r.get()?,
        })
    }
}

impl JdwpEncode for EventSet {
    fn encode(&self, w: &mut JdwpWriter) -> JdwpResult<()> {
        self.suspend_policy.encode(w)?;
        self.events.encode(w)
    }
}

/// A single event from a composite packet.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum EventResponse {
    VmStart {
        request_id: i32,
        thread: ThreadId,
    },
    VmDeath {
        request_id: i32,
    },
    SingleStep {
        request_id: i32,
        thread: ThreadId,
        location: Location,
    },
    Breakpoint {
        request_id: i32,
        thread: ThreadId,
        location: Location,
    },
    MethodEntry {
        request_id: i32,
        thread: ThreadId,
        location: Location,
    },
    /// Also carries kind 42, in which case `return_value` is set.
    MethodExit {
        request_id: i32,
        thread: ThreadId,
        location: Location,
        return_value: Option<Value>,
    },
    /// Also carries kind 30.
    Exception {
        request_id: i32,
        thread: ThreadId,
        location: Location,
        exception: TaggedObjectId,
        catch_location: Option<Location>,
    },
    ThreadStart {
        request_id: i32,
        thread: ThreadId,
    },
    ThreadDeath {
        request_id: i32,
        thread: ThreadId,
    },
    ClassPrepare {
        request_id: i32,
        thread: ThreadId,
        ref_type_tag: TypeTag,
        type_id: ReferenceTypeId,
        signature: String,
        status: i32,
    },
    ClassUnload {
        request_id: i32,
        signature: String,
    },
    FieldAccess {
        request_id: i32,
        thread: ThreadId,
        location: Location,
        ref_type_tag: TypeTag,
        type_id: ReferenceTypeId,
        field_id: FieldId,
        object: TaggedObjectId,
    },
    FieldModification {
        request_id: i32,
        thread: ThreadId,
        location: Location,
        ref_type_tag: TypeTag,
        type_id: ReferenceTypeId,
        field_id: FieldId,
        object: TaggedObjectId,
        value_to_be: Value,
    },
}

impl EventResponse {
    /// The id of the request that produced this event.
    pub fn request_id(&self) -> i32 {
        match self {
            EventResponse::VmStart { request_id, .. }
            | EventResponse::VmDeath { request_id }
            | EventResponse::SingleStep { request_id, .. }
            | EventResponse::Breakpoint { request_id, .. }
            | EventResponse::MethodEntry { request_id, .. }
            | EventResponse::MethodExit { request_id, .. }
            | EventResponse::Exception { request_id, .. }
            | EventResponse::ThreadStart { request_id, .. }
            | EventResponse::ThreadDeath { request_id, .. }
            | EventResponse::ClassPrepare { request_id, .. }
            | EventResponse::ClassUnload { request_id, .. }
            | EventResponse::FieldAccess { request_id, .. }
            | EventResponse::FieldModification { request_id, .. } => *request_id,
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            EventResponse::VmStart { .. } => EventKind::VmStart,
            EventResponse::VmDeath { .. } => EventKind::VmDeath,
            EventResponse::SingleStep { .. } => EventKind::SingleStep,
            EventResponse::Breakpoint { .. } => EventKind::Breakpoint,
            EventResponse::MethodEntry { .. } => EventKind::MethodEntry,
            EventResponse::MethodExit {
                return_value: Some(_),
                ..
            } => EventKind::MethodExitWithReturnValue,
            EventResponse::MethodExit { .. } => EventKind::MethodExit,
            EventResponse::Exception { .. } => EventKind::Exception,
            EventResponse::ThreadStart { .. } => EventKind::ThreadStart,
            EventResponse::ThreadDeath { .. } => EventKind::ThreadDeath,
            EventResponse::ClassPrepare { .. } => EventKind::ClassPrepare,
            EventResponse::ClassUnload { .. } => EventKind::ClassUnload,
            EventResponse::FieldAccess { .. } => EventKind::FieldAccess,
            EventResponse::FieldModification { .. } => EventKind::FieldModification,
        }
    }

    pub fn thread(&self) -> Option<ThreadId> {
        match self {
            EventResponse::VmDeath { .. } | EventResponse::ClassUnload { .. } => None,
            EventResponse::VmStart { thread, .. }
            | EventResponse::SingleStep { thread, .. }
            | EventResponse::Breakpoint { thread, .. }
            | EventResponse::MethodEntry { thread, .. }
            | EventResponse::MethodExit { thread, .. }
            | EventResponse::Exception { thread, .. }
            | EventResponse::ThreadStart { thread, .. }
            | EventResponse::ThreadDeath { thread, .. }
            | EventResponse::ClassPrepare { thread, .. }
            | EventResponse::FieldAccess { thread, .. }
            | EventResponse::FieldModification { thread, .. } => Some(*thread),
        }
    }

    pub fn location(&self) -> Option<&Location> {
        match self {
            EventResponse::SingleStep { location, .. }
            | EventResponse::Breakpoint { location, .. }
            | EventResponse::MethodEntry { location, .. }
            | EventResponse::MethodExit { location, .. }
            | EventResponse::Exception { location, .. }
            | EventResponse::FieldAccess { location, .. }
            | EventResponse::FieldModification { location, .. } => Some(location),
            _ => None,
        }
    }
}

impl JdwpDecode for EventResponse {
    fn decode(r: &mut JdwpReader<'_>) -> JdwpResult<Self> {
        let kind = EventKind::decode(r)?;
        let request_id = r.get_i32()?;

        let event = match kind {
            EventKind::VmStart => EventResponse::VmStart {
                request_id,
                thread: r.get()?,
            },
            EventKind::VmDeath => EventResponse::VmDeath { request_id },
            EventKind::SingleStep => EventResponse::SingleStep {
                request_id,
                thread: r.get()?,
                location: r.get()?,
            },
            EventKind::Breakpoint => EventResponse::Breakpoint {
                request_id,
                thread: r.get()?,
                location: r.get()?,
            },
            EventKind::MethodEntry => EventResponse::MethodEntry {
                request_id,
                thread: r.get()?,
                location: r.get()?,
            },
            EventKind::MethodExit => EventResponse::MethodExit {
                request_id,
                thread: r.get()?,
                location: r.get()?,
                return_value: None,
            },
            EventKind::MethodExitWithReturnValue => EventResponse::MethodExit {
                request_id,
                thread: r.get()?,
                location: r.get()?,
                return_value: Some(r.get()?),
            },
            EventKind::Exception | EventKind::ExceptionCatch => {
                let thread = r.get()?;
                let location = r.get()?;
                let exception = r.get()?;
                let catch_location: Location = r.get()?;
                EventResponse::Exception {
                    request_id,
                    thread,
                    location,
                    exception,
                    catch_location: (!catch_location.is_null()).then_some(catch_location),
                }
            }
            EventKind::ThreadStart => EventResponse::ThreadStart {
                request_id,
                thread: r.get()?,
            },
            EventKind::ThreadDeath => EventResponse::ThreadDeath {
                request_id,
                thread: r.get()?,
            },
            EventKind::ClassPrepare => EventResponse::ClassPrepare {
                request_id,
                thread: r.get()?,
                ref_type_tag: r.get()?,
                type_id: r.get()?,
                signature: r.get_string()?,
                status: r.get_i32()?,
            },
            EventKind::ClassUnload => EventResponse::ClassUnload {
                request_id,
                signature: r.get_string()?,
            },
            EventKind::FieldAccess => EventResponse::FieldAccess {
                request_id,
                thread: r.get()?,
                location: r.get()?,
                ref_type_tag: r.get()?,
                type_id: r.get()?,
                field_id: r.get()?,
                object: r.get()?,
            },
            EventKind::FieldModification => EventResponse::FieldModification {
                request_id,
                thread: r.get()?,
                location: r.get()?,
                ref_type_tag: r.get()?,
                type_id: r.get()?,
                field_id: r.get()?,
                object: r.get()?,
                value_to_be: r.get()?,
            },
        };
        Ok(event)
    }
}

impl JdwpEncode for EventResponse {
    fn encode(&self, w: &mut JdwpWriter) -> JdwpResult<()> {
        self.kind().encode(w)?;
        w.put_i32(self.request_id());

        match self {
            EventResponse::VmDeath { .. } => {}
            EventResponse::VmStart { thread, .. }
            | EventResponse::ThreadStart { thread, .. }
            | EventResponse::ThreadDeath { thread, .. } => thread.encode(w)?,
            EventResponse::SingleStep {
                thread, location, ..
            }
            | EventResponse::Breakpoint {
                thread, location, ..
            }
            | EventResponse::MethodEntry {
                thread, location, ..
            } => {
                thread.encode(w)?;
                location.encode(w)?;
            }
            EventResponse::MethodExit {
                thread,
                location,
                return_value,
                ..
            } => {
                thread.encode(w)?;
                location.encode(w)?;
                if let Some(value) = return_value {
                    value.encode(w)?;
                }
            }
            EventResponse::Exception {
                thread,
                location,
                exception,
                catch_location,
                ..
            } => {
                thread.encode(w)?;
                location.encode(w)?;
                exception.encode(w)?;
                catch_location.unwrap_or_default().encode(w)?;
            }
            EventResponse::ClassPrepare {
                thread,
                ref_type_tag,
                type_id,
                signature,
                status,
                ..
            } => {
                thread.encode(w)?;
                ref_type_tag.encode(w)?;
                type_id.encode(w)?;
                w.put_string(signature);
                w.put_i32(*status);
            }
            EventResponse::ClassUnload { signature, .. } => w.put_string(signature),
            EventResponse::FieldAccess {
                thread,
                location,
                ref_type_tag,
                type_id,
                field_id,
                object,
                ..
            } => {
                thread.encode(w)?;
                location.encode(w)?;
                ref_type_tag.encode(w)?;
                type_id.encode(w)?;
                field_id.encode(w)?;
                object.encode(w)?;
            }
            EventResponse::FieldModification {
                thread,
                location,
                ref_type_tag,
                type_id,
                field_id,
                object,
                value_to_be,
                ..
            } => {
                thread.encode(w)?;
                location.encode(w)?;
                ref_type_tag.encode(w)?;
                type_id.encode(w)?;
                field_id.encode(w)?;
                object.encode(w)?;
                value_to_be.encode(w)?;
            }
        }
        Ok(())
    }
}

// Event request modifiers. Sent with EventRequest.Set only; never decoded.
#[derive(Debug, Clone, PartialEq)]
pub enum EventModifier {
    Count(i32),
    ThreadOnly(ThreadId),
    ClassOnly(ReferenceTypeId),
    ClassMatch(String),
    ClassExclude(String),
    LocationOnly(Location),
    ExceptionOnly {
        ref_type: ReferenceTypeId, // null for any exception
        caught: bool,
        uncaught: bool,
    },
    FieldOnly {
        ref_type: ReferenceTypeId,
        field_id: FieldId,
    },
    Step {
        thread: ThreadId,
        size: i32,
        depth: i32,
    },
    InstanceOnly(ObjectId),
}

impl EventModifier {
    pub fn mod_kind(&self) -> u8 {
        match self {
            EventModifier::Count(_) => modifier_kinds::COUNT,
            EventModifier::ThreadOnly(_) => modifier_kinds::THREAD_ONLY,
            EventModifier::ClassOnly(_) => modifier_kinds::CLASS_ONLY,
            EventModifier::ClassMatch(_) => modifier_kinds::CLASS_MATCH,
            EventModifier::ClassExclude(_) => modifier_kinds::CLASS_EXCLUDE,
            EventModifier::LocationOnly(_) => modifier_kinds::LOCATION_ONLY,
            EventModifier::ExceptionOnly { .. } => modifier_kinds::EXCEPTION_ONLY,
            EventModifier::FieldOnly { .. } => modifier_kinds::FIELD_ONLY,
            EventModifier::Step { .. } => modifier_kinds::STEP,
            EventModifier::InstanceOnly(_) => modifier_kinds::INSTANCE_ONLY,
        }
    }
}

impl JdwpEncode for EventModifier {
    fn encode(&self, w: &mut JdwpWriter) -> JdwpResult<()> {
        w.put_u8(self.mod_kind());
        match self {
            EventModifier::Count(count) => w.put_i32(*count),
            EventModifier::ThreadOnly(thread) => thread.encode(w)?,
            EventModifier::ClassOnly(class) => class.encode(w)?,
            EventModifier::ClassMatch(pattern) | EventModifier::ClassExclude(pattern) => {
                w.put_string(pattern)
            }
            EventModifier::LocationOnly(location) => location.encode(w)?,
            EventModifier::ExceptionOnly {
                ref_type,
                caught,
                uncaught,
            } => {
                ref_type.encode(w)?;
                w.put_bool(*caught);
                w.put_bool(*uncaught);
            }
            EventModifier::FieldOnly { ref_type, field_id } => {
                ref_type.encode(w)?;
                field_id.encode(w)?;
            }
            EventModifier::Step {
                thread,
                size,
                depth,
            } => {
                thread.encode(w)?;
                w.put_i32(*size);
                w.put_i32(*depth);
            }
            EventModifier::InstanceOnly(object) => object.encode(w)?,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode_exact, encode_to_vec};

    fn location(class: u64, method: u64, index: u64) -> Location {
        Location {
            type_tag: TypeTag::Class as u8,
            class_id: ReferenceTypeId(class),
            method_id: MethodId(method),
            index,
        }
    }

    #[test]
    fn test_class_match_modifier_layout() {
        let modifier = EventModifier::ClassMatch("*.String".to_string());
        let bytes = encode_to_vec(&modifier, IdSizes::default()).unwrap();

        let mut expected = vec![5, 0, 0, 0, 8];
        expected.extend_from_slice(b"*.String");
        assert_eq!(bytes, expected);
    }

    #[test]
    fn test_decode_composite_breakpoint_event() {
        let sizes = IdSizes::default();
        let mut w = JdwpWriter::new(sizes);
        w.put_u8(SuspendPolicy::EventThread as u8);
        w.put_i32(1);
        w.put_u8(event_kinds::BREAKPOINT);
        w.put_i32(7);
        w.put_u64(0x100); // thread
        w.put_u8(1);
        w.put_u64(0x200); // class
        w.put_u64(0x300); // method
        w.put_u64(12); // index
        let bytes = w.into_vec();

        let set: EventSet = decode_exact(&bytes, sizes).unwrap();
        assert_eq!(set.suspend_policy, SuspendPolicy::EventThread);
        assert_eq!(
            set.events,
            vec![EventResponse::Breakpoint {
                request_id: 7,
                thread: ThreadId(0x100),
                location: location(0x200, 0x300, 12),
            }]
        );
        assert_eq!(set.events[0].kind(), EventKind::Breakpoint);
    }

    #[test]
    fn test_unknown_event_kind_is_a_decode_error() {
        let bytes = [0u8, 0, 0, 0, 1, 3, 0, 0, 0, 1];
        let err = decode_exact::<EventSet>(&bytes, IdSizes::default()).unwrap_err();
        assert!(matches!(err, JdwpError::Decode(_)));
    }

    #[test]
    fn test_method_exit_with_return_value_uses_method_exit_shape() {
        let sizes = IdSizes::uniform(4);
        let event = EventResponse::MethodExit {
            request_id: 3,
            thread: ThreadId(9),
            location: location(1, 2, 3),
            return_value: Some(Value::Int(42)),
        };
        let bytes = encode_to_vec(&event, sizes).unwrap();
        assert_eq!(bytes[0], event_kinds::METHOD_EXIT_WITH_RETURN_VALUE);

        let decoded: EventResponse = decode_exact(&bytes, sizes).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_uncaught_exception_has_no_catch_location() {
        let sizes = IdSizes::default();
        let event = EventResponse::Exception {
            request_id: 5,
            thread: ThreadId(1),
            location: location(2, 3, 4),
            exception: TaggedObjectId {
                tag: Tag::Object,
                id: ObjectId(0x50),
            },
            catch_location: None,
        };
        let bytes = encode_to_vec(&event, sizes).unwrap();
        let decoded: EventResponse = decode_exact(&bytes, sizes).unwrap();

        assert_eq!(decoded, event);
    }

    #[test]
    fn test_exception_catch_kind_decodes_as_exception() {
        let sizes = IdSizes::default();
        let mut bytes = encode_to_vec(
            &EventResponse::Exception {
                request_id: 2,
                thread: ThreadId(1),
                location: location(2, 3, 4),
                exception: TaggedObjectId {
                    tag: Tag::Object,
                    id: ObjectId(0x50),
                },
                catch_location: Some(location(2, 3, 9)),
            },
            sizes,
        )
        .unwrap();
        bytes[0] = event_kinds::EXCEPTION_CATCH;

        let decoded: EventResponse = decode_exact(&bytes, sizes).unwrap();
        assert_eq!(decoded.kind(), EventKind::Exception);
        assert_eq!(decoded.request_id(), 2);
    }

    #[test]
    fn test_class_prepare_roundtrip() {
        let sizes = IdSizes::default();
        let event = EventResponse::ClassPrepare {
            request_id: 11,
            thread: ThreadId(1),
            ref_type_tag: TypeTag::Class,
            type_id: ReferenceTypeId(0x77),
            signature: "Ljava/lang/String;".to_string(),
            status: 7,
        };
        let bytes = encode_to_vec(&event, sizes).unwrap();
        assert_eq!(decode_exact::<EventResponse>(&bytes, sizes).unwrap(), event);
    }
}
