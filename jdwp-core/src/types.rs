// JDWP type definitions
//
// Identifiers, negotiated id sizes, locations and the tagged value union.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::codec::{JdwpDecode, JdwpEncode, JdwpReader, JdwpWriter};
use crate::protocol::{JdwpError, JdwpResult};

/// Identifier categories; each has its own negotiated width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdKind {
    Field,
    Method,
    Object,
    ReferenceType,
    Frame,
}

/// Byte widths of each identifier category, as answered by
/// VirtualMachine.IDSizes. Field order is wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdSizes {
    pub field_id_size: i32,
    pub method_id_size: i32,
    pub object_id_size: i32,
    pub reference_type_id_size: i32,
    pub frame_id_size: i32,
}

impl Default for IdSizes {
    // Used until the target has answered IDSizes.
    fn default() -> Self {
        Self::uniform(8)
    }
}

impl IdSizes {
    pub fn uniform(size: i32) -> Self {
        Self {
            field_id_size: size,
            method_id_size: size,
            object_id_size: size,
            reference_type_id_size: size,
            frame_id_size: size,
        }
    }

    pub fn width(&self, kind: IdKind) -> JdwpResult<usize> {
        let size = match kind {
            IdKind::Field => self.field_id_size,
            IdKind::Method => self.method_id_size,
            IdKind::Object => self.object_id_size,
            IdKind::ReferenceType => self.reference_type_id_size,
            IdKind::Frame => self.frame_id_size,
        };
        match size {
            1..=8 => Ok(size as usize),
            _ => Err(JdwpError::Protocol(format!(
                "Unsupported {:?} id size: {}",
                kind, size
            ))),
        }
    }

    pub fn validate(&self) -> JdwpResult<()> {
        for kind in [
            IdKind::Field,
            IdKind::Method,
            IdKind::Object,
            IdKind::ReferenceType,
            IdKind::Frame,
        ] {
            self.width(kind)?;
        }
        Ok(())
    }
}

impl JdwpEncode for IdSizes {
    fn encode(&self, w: &mut JdwpWriter) -> JdwpResult<()> {
        w.put_i32(self.field_id_size);
        w.put_i32(self.method_id_size);
        w.put_i32(self.object_id_size);
        w.put_i32(self.reference_type_id_size);
        w.put_i32(self.frame_id_size);
        Ok(())
    }
}

impl JdwpDecode for IdSizes {
    fn decode(r: &mut JdwpReader<'_>) -> JdwpResult<Self> {
        let sizes = IdSizes {
            field_id_size: r.get_i32()?,
            method_id_size: r.get_i32()?,
            object_id_size: r.get_i32()?,
            reference_type_id_size: r.get_i32()?,
            frame_id_size: r.get_i32()?,
        };
        sizes.validate()?;
        Ok(sizes)
    }
}

macro_rules! jdwp_id {
    ($($(#[$meta:meta])* $name:ident => $kind:ident;)*) => {
        $(
            $(#[$meta])*
            #[derive(
                Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
            )]
            #[serde(transparent)]
            pub struct $name(pub u64);

            impl $name {
                pub const KIND: IdKind = IdKind::$kind;

                pub fn is_null(&self) -> bool {
                    self.0 == 0
                }
            }

            impl From<u64> for $name {
                fn from(raw: u64) -> Self {
                    $name(raw)
                }
            }

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, "@{:x}", self.0)
                }
            }

            impl JdwpEncode for $name {
                fn encode(&self, w: &mut JdwpWriter) -> JdwpResult<()> {
                    w.put_id(Self::KIND, self.0)
                }
            }

            impl JdwpDecode for $name {
                fn decode(r: &mut JdwpReader<'_>) -> JdwpResult<Self> {
                    r.get_id(Self::KIND).map($name)
                }
            }
        )*
    };
}

jdwp_id! {
    ObjectId => Object;
    ThreadId => Object;
    ThreadGroupId => Object;
    StringId => Object;
    ClassLoaderId => Object;
    ClassObjectId => Object;
    ArrayId => Object;
    ReferenceTypeId => ReferenceType;
    MethodId => Method;
    FieldId => Field;
    FrameId => Frame;
}

pub type ClassId = ReferenceTypeId;

// Specialized object ids are object ids on the wire.
macro_rules! object_subtype {
    ($($name:ident),*) => {
        $(
            impl From<$name> for ObjectId {
                fn from(id: $name) -> Self {
                    ObjectId(id.0)
                }
            }
        )*
    };
}

object_subtype!(ThreadId, ThreadGroupId, StringId, ClassLoaderId, ClassObjectId, ArrayId);

/// Reference type kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum TypeTag {
    Class = 1,
    Interface = 2,
    Array = 3,
}

impl TryFrom<u8> for TypeTag {
    type Error = JdwpError;

    fn try_from(v: u8) -> JdwpResult<Self> {
        match v {
            1 => Ok(TypeTag::Class),
            2 => Ok(TypeTag::Interface),
            3 => Ok(TypeTag::Array),
            _ => Err(JdwpError::decode(format!("Unknown type tag: {}", v))),
        }
    }
}

impl JdwpEncode for TypeTag {
    fn encode(&self, w: &mut JdwpWriter) -> JdwpResult<()> {
        w.put_u8(*self as u8);
        Ok(())
    }
}

impl JdwpDecode for TypeTag {
    fn decode(r: &mut JdwpReader<'_>) -> JdwpResult<Self> {
        TypeTag::try_from(r.get_u8()?)
    }
}

// Location identifies a code position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Location {
    pub type_tag: u8, // 1=class, 2=interface, 3=array; 0 only in null locations
    pub class_id: ReferenceTypeId,
    pub method_id: MethodId,
    pub index: u64, // bytecode index (PC)
}

impl Location {
    /// Uncaught exceptions report an all-zero catch location.
    pub fn is_null(&self) -> bool {
        self.type_tag == 0 && self.class_id.is_null() && self.method_id.is_null() && self.index == 0
    }
}

impl JdwpEncode for Location {
    fn encode(&self, w: &mut JdwpWriter) -> JdwpResult<()> {
        w.put_u8(self.type_tag);
        self.class_id.encode(w)?;
        self.method_id.encode(w)?;
        w.put_u64(self.index);
        Ok(())
    }
}

impl JdwpDecode for Location {
    fn decode(r: &mut JdwpReader<'_>) -> JdwpResult<Self> {
        Ok(Location {
            type_tag: r.get_u8()?,
            class_id: r.get()?,
            method_id: r.get()?,
            index: r.get_u64()?,
        })
    }
}

// Type tags for values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Tag {
    Array = 91,        // '['
    Byte = 66,         // 'B'
    Char = 67,         // 'C'
    Object = 76,       // 'L'
    Float = 70,        // 'F'
    Double = 68,       // 'D'
    Int = 73,          // 'I'
    Long = 74,         // 'J'
    Short = 83,        // 'S'
    Void = 86,         // 'V'
    Boolean = 90,      // 'Z'
    String = 115,      // 's'
    Thread = 116,      // 't'
    ThreadGroup = 103, // 'g'
    ClassLoader = 108, // 'l'
    ClassObject = 99,  // 'c'
}

impl TryFrom<u8> for Tag {
    type Error = JdwpError;

    fn try_from(v: u8) -> JdwpResult<Self> {
        Ok(match v {
            91 => Tag::Array,
            66 => Tag::Byte,
            67 => Tag::Char,
            76 => Tag::Object,
            70 => Tag::Float,
            68 => Tag::Double,
            73 => Tag::Int,
            74 => Tag::Long,
            83 => Tag::Short,
            86 => Tag::Void,
            90 => Tag::Boolean,
            115 => Tag::String,
            116 => Tag::Thread,
            103 => Tag::ThreadGroup,
            108 => Tag::ClassLoader,
            99 => Tag::ClassObject,
            _ => return Err(JdwpError::decode(format!("Unknown value tag: {}", v))),
        })
    }
}

impl JdwpEncode for Tag {
    fn encode(&self, w: &mut JdwpWriter) -> JdwpResult<()> {
        w.put_u8(*self as u8);
        Ok(())
    }
}

impl JdwpDecode for Tag {
    fn decode(r: &mut JdwpReader<'_>) -> JdwpResult<Self> {
        Tag::try_from(r.get_u8()?)
    }
}

/// A value of any JDWP type.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Boolean(bool),
    Byte(i8),
    Char(u16),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Void,
    Object(ObjectId),
    Array(ArrayId),
    String(StringId),
    Thread(ThreadId),
    ThreadGroup(ThreadGroupId),
    ClassLoader(ClassLoaderId),
    ClassObject(ClassObjectId),
}

impl Value {
    pub fn tag(&self) -> Tag {
        match self {
            Value::Boolean(_) => Tag::Boolean,
            Value::Byte(_) => Tag::Byte,
            Value::Char(_) => Tag::Char,
            Value::Short(_) => Tag::Short,
            Value::Int(_) => Tag::Int,
            Value::Long(_) => Tag::Long,
            Value::Float(_) => Tag::Float,
            Value::Double(_) => Tag::Double,
            Value::Void => Tag::Void,
            Value::Object(_) => Tag::Object,
            Value::Array(_) => Tag::Array,
            Value::String(_) => Tag::String,
            Value::Thread(_) => Tag::Thread,
            Value::ThreadGroup(_) => Tag::ThreadGroup,
            Value::ClassLoader(_) => Tag::ClassLoader,
            Value::ClassObject(_) => Tag::ClassObject,
        }
    }

    /// The object id for any reference-typed value.
    pub fn object_id(&self) -> Option<ObjectId> {
        match *self {
            Value::Object(id) => Some(id),
            Value::Array(id) => Some(id.into()),
            Value::String(id) => Some(id.into()),
            Value::Thread(id) => Some(id.into()),
            Value::ThreadGroup(id) => Some(id.into()),
            Value::ClassLoader(id) => Some(id.into()),
            Value::ClassObject(id) => Some(id.into()),
            _ => None,
        }
    }

    /// Write the payload only, for positions whose type is known from context.
    pub fn encode_untagged(&self, w: &mut JdwpWriter) -> JdwpResult<()> {
        match self {
            Value::Boolean(v) => w.put_bool(*v),
            Value::Byte(v) => w.put_i8(*v),
            Value::Char(v) => w.put_u16(*v),
            Value::Short(v) => w.put_i16(*v),
            Value::Int(v) => w.put_i32(*v),
            Value::Long(v) => w.put_i64(*v),
            Value::Float(v) => w.put_f32(*v),
            Value::Double(v) => w.put_f64(*v),
            Value::Void => {}
            Value::Object(id) => id.encode(w)?,
            Value::Array(id) => id.encode(w)?,
            Value::String(id) => id.encode(w)?,
            Value::Thread(id) => id.encode(w)?,
            Value::ThreadGroup(id) => id.encode(w)?,
            Value::ClassLoader(id) => id.encode(w)?,
            Value::ClassObject(id) => id.encode(w)?,
        }
        Ok(())
    }

    /// Read a payload whose tag is known from context.
    pub fn decode_untagged(tag: Tag, r: &mut JdwpReader<'_>) -> JdwpResult<Self> {
        Ok(match tag {
            Tag::Boolean => Value::Boolean(r.get_bool()?),
            Tag::Byte => Value::Byte(r.get_i8()?),
            Tag::Char => Value::Char(r.get_u16()?),
            Tag::Short => Value::Short(r.get_i16()?),
            Tag::Int => Value::Int(r.get_i32()?),
            Tag::Long => Value::Long(r.get_i64()?),
            Tag::Float => Value::Float(r.get_f32()?),
            Tag::Double => Value::Double(r.get_f64()?),
            Tag::Void => Value::Void,
            Tag::Object => Value::Object(r.get()?),
            Tag::Array => Value::Array(r.get()?),
            Tag::String => Value::String(r.get()?),
            Tag::Thread => Value::Thread(r.get()?),
            Tag::ThreadGroup => Value::ThreadGroup(r.get()?),
            Tag::ClassLoader => Value::ClassLoader(r.get()?),
            Tag::ClassObject => Value::ClassObject(r.get()?),
        })
    }

    /// Format value for display
    pub fn format(&self) -> String {
        match self {
            Value::Byte(v) => format!("(byte) {}", v),
            Value::Char(v) => format!(
                "(char) '{}'",
                char::from_u32(u32::from(*v)).unwrap_or('?')
            ),
            Value::Float(v) => format!("(float) {}", v),
            Value::Double(v) => format!("(double) {}", v),
            Value::Int(v) => format!("(int) {}", v),
            Value::Long(v) => format!("(long) {}", v),
            Value::Short(v) => format!("(short) {}", v),
            Value::Boolean(v) => format!("(boolean) {}", v),
            Value::Void => "(void)".to_string(),
            other => {
                let kind = match other.tag() {
                    Tag::Array => "array",
                    Tag::String => "string",
                    Tag::Thread => "thread",
                    Tag::ThreadGroup => "thread group",
                    Tag::ClassLoader => "class loader",
                    Tag::ClassObject => "class object",
                    _ => "object",
                };
                match other.object_id() {
                    Some(id) if !id.is_null() => format!("({}) {}", kind, id),
                    _ => format!("({}) null", kind),
                }
            }
        }
    }
}

// Tagged encoding: 1-byte tag followed by the payload.
impl JdwpEncode for Value {
    fn encode(&self, w: &mut JdwpWriter) -> JdwpResult<()> {
        self.tag().encode(w)?;
        self.encode_untagged(w)
    }
}

impl JdwpDecode for Value {
    fn decode(r: &mut JdwpReader<'_>) -> JdwpResult<Self> {
        let tag = Tag::decode(r)?;
        Value::decode_untagged(tag, r)
    }
}

/// An object id prefixed with the tag of its runtime type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaggedObjectId {
    pub tag: Tag,
    pub id: ObjectId,
}

impl JdwpEncode for TaggedObjectId {
    fn encode(&self, w: &mut JdwpWriter) -> JdwpResult<()> {
        self.tag.encode(w)?;
        self.id.encode(w)
    }
}

impl JdwpDecode for TaggedObjectId {
    fn decode(r: &mut JdwpReader<'_>) -> JdwpResult<Self> {
        Ok(TaggedObjectId {
            tag: r.get()?,
            id: r.get()?,
        })
    }
}
