//! Payload shapes and the erased values that travel through middleware.
//!
//! Every routable type implements [`Message`]. Application structs use the
//! default implementation:
//!
//! ```rust,ignore
//! struct OpenAccount { owner: String }
//! impl Message for OpenAccount {}
//! ```
//!
//! The crate also implements `Message` for primitives, strings, collections
//! and pointer-like wrappers. Those implementations exist so that the bus can
//! *reject* them with a precise shape error: only structs and pointers to
//! structs are routable.

use crate::errors::{BusError, BusResult};
use crate::key::HandlerKey;
use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

/// Structural category of a payload or result type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadShape {
    /// A record type.
    Struct,
    /// A pointer (`Box`, `Arc`, `Option`) to a record type.
    PointerToStruct,
    /// A pointer to something that is neither a struct nor a pointer.
    Pointer,
    /// A pointer to another pointer.
    PointerToPointer,
    /// A scalar or string.
    Primitive,
    /// A list-like collection.
    Sequence,
    /// A keyed collection.
    Map,
    /// A type that does not implement [`Message`], such as a trait object.
    Opaque,
}

impl PayloadShape {
    /// Whether values of this shape may be routed through a bus.
    pub const fn is_routable(self) -> bool {
        matches!(self, Self::Struct | Self::PointerToStruct)
    }

    /// Shape of a pointer to a value of this shape.
    pub const fn behind_pointer(self) -> Self {
        match self {
            Self::Struct => Self::PointerToStruct,
            Self::PointerToStruct | Self::Pointer | Self::PointerToPointer => {
                Self::PointerToPointer
            }
            Self::Primitive | Self::Sequence | Self::Map | Self::Opaque => Self::Pointer,
        }
    }
}

impl fmt::Display for PayloadShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Struct => "struct",
            Self::PointerToStruct => "pointer to struct",
            Self::Pointer => "pointer to non-struct",
            Self::PointerToPointer => "pointer to pointer",
            Self::Primitive => "primitive",
            Self::Sequence => "sequence",
            Self::Map => "map",
            Self::Opaque => "non-message type",
        };
        f.write_str(label)
    }
}

/// A type that can be submitted to a bus as a command, query, event or
/// query result.
pub trait Message: Any + Send + Sync {
    /// Structural shape of the type. Defaults to [`PayloadShape::Struct`].
    fn shape() -> PayloadShape {
        PayloadShape::Struct
    }

    /// Whether this value is a nil pointer.
    fn is_nil(&self) -> bool {
        false
    }
}

macro_rules! impl_message_for_primitives {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Message for $ty {
                fn shape() -> PayloadShape {
                    PayloadShape::Primitive
                }
            }
        )*
    };
}

impl_message_for_primitives!(
    (),
    bool,
    char,
    u8,
    u16,
    u32,
    u64,
    u128,
    usize,
    i8,
    i16,
    i32,
    i64,
    i128,
    isize,
    f32,
    f64,
    String,
    &'static str,
);

macro_rules! impl_message_for_collections {
    ($shape:ident => $($ty:ident<$($param:ident),+>),* $(,)?) => {
        $(
            impl<$($param: Send + Sync + 'static),+> Message for $ty<$($param),+> {
                fn shape() -> PayloadShape {
                    PayloadShape::$shape
                }
            }
        )*
    };
}

impl_message_for_collections!(Sequence => Vec<T>, VecDeque<T>, HashSet<T>, BTreeSet<T>);
impl_message_for_collections!(Map => HashMap<K, V>, BTreeMap<K, V>);

impl<T: Message> Message for Box<T> {
    fn shape() -> PayloadShape {
        T::shape().behind_pointer()
    }
}

impl<T: Message> Message for Arc<T> {
    fn shape() -> PayloadShape {
        T::shape().behind_pointer()
    }
}

impl<T: Message> Message for Option<T> {
    fn shape() -> PayloadShape {
        T::shape().behind_pointer()
    }

    fn is_nil(&self) -> bool {
        self.is_none()
    }
}

/// A type-erased payload.
///
/// Cloning is cheap: the value is shared, which is how one event reaches
/// every handler registered for it.
#[derive(Clone)]
pub struct Payload {
    key: HandlerKey,
    shape: PayloadShape,
    nil: bool,
    value: Arc<dyn Any + Send + Sync>,
}

impl Payload {
    /// Erases `message`.
    pub fn new<M: Message>(message: M) -> Self {
        Self::from_arc(Arc::new(message))
    }

    /// Erases an already shared `message` without copying it.
    pub fn from_arc<M: Message>(message: Arc<M>) -> Self {
        Self {
            key: HandlerKey::of::<M>(),
            shape: M::shape(),
            nil: M::is_nil(&message),
            value: message,
        }
    }

    /// Routing key of the payload's runtime type.
    pub const fn key(&self) -> HandlerKey {
        self.key
    }

    /// Shape of the payload's runtime type.
    pub const fn shape(&self) -> PayloadShape {
        self.shape
    }

    /// Whether the payload is a nil pointer.
    pub const fn is_nil(&self) -> bool {
        self.nil
    }

    /// Whether the payload holds an `M`.
    pub fn is<M: Message>(&self) -> bool {
        self.value.is::<M>()
    }

    /// Borrows the payload as an `M`.
    pub fn downcast_ref<M: Message>(&self) -> Option<&M> {
        self.value.downcast_ref::<M>()
    }

    /// Returns a shared handle to the payload as an `M`.
    pub fn downcast<M: Message>(&self) -> Option<Arc<M>> {
        Arc::clone(&self.value).downcast::<M>().ok()
    }

    /// Checks that the payload may be dispatched: a non-nil struct or
    /// pointer to struct.
    pub fn ensure_routable(&self) -> BusResult<()> {
        if !self.shape.is_routable() {
            return Err(BusError::InvalidPayload {
                type_name: self.key.type_name(),
                shape: self.shape,
            });
        }
        if self.nil {
            return Err(BusError::NilPayload(self.key));
        }
        Ok(())
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Payload")
            .field("type", &self.key.type_name())
            .field("shape", &self.shape)
            .field("nil", &self.nil)
            .finish_non_exhaustive()
    }
}

/// A type-erased query result.
pub struct Reply {
    key: HandlerKey,
    value: Box<dyn Any + Send>,
}

impl Reply {
    /// Erases `result`.
    pub fn new<R: Message>(result: R) -> Self {
        Self {
            key: HandlerKey::of::<R>(),
            value: Box::new(result),
        }
    }

    /// Key of the result's runtime type.
    pub const fn key(&self) -> HandlerKey {
        self.key
    }

    /// Borrows the result as an `R`.
    pub fn downcast_ref<R: Message>(&self) -> Option<&R> {
        self.value.downcast_ref::<R>()
    }

    /// Restores the result as an `R`, handing the reply back on mismatch.
    pub fn downcast<R: Message>(self) -> Result<R, Self> {
        let key = self.key;
        self.value
            .downcast::<R>()
            .map(|result| *result)
            .map_err(|value| Self { key, value })
    }
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reply")
            .field("type", &self.key.type_name())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Eq)]
    struct Deposit {
        amount: u64,
    }

    impl Message for Deposit {}

    #[test]
    fn structs_and_pointers_to_structs_are_routable() {
        assert_eq!(Deposit::shape(), PayloadShape::Struct);
        assert_eq!(<Box<Deposit>>::shape(), PayloadShape::PointerToStruct);
        assert_eq!(<Arc<Deposit>>::shape(), PayloadShape::PointerToStruct);
        assert_eq!(<Option<Deposit>>::shape(), PayloadShape::PointerToStruct);
        assert!(Deposit::shape().is_routable());
        assert!(<Box<Deposit>>::shape().is_routable());
    }

    #[test]
    fn non_struct_shapes_are_not_routable() {
        assert_eq!(u32::shape(), PayloadShape::Primitive);
        assert_eq!(String::shape(), PayloadShape::Primitive);
        assert_eq!(<Vec<Deposit>>::shape(), PayloadShape::Sequence);
        assert_eq!(<HashMap<String, u32>>::shape(), PayloadShape::Map);
        assert_eq!(<Box<Box<Deposit>>>::shape(), PayloadShape::PointerToPointer);
        assert_eq!(<Box<u32>>::shape(), PayloadShape::Pointer);

        for shape in [
            PayloadShape::Primitive,
            PayloadShape::Sequence,
            PayloadShape::Map,
            PayloadShape::Pointer,
            PayloadShape::PointerToPointer,
            PayloadShape::Opaque,
        ] {
            assert!(!shape.is_routable(), "{shape} must not be routable");
        }
    }

    #[test]
    fn payload_downcasts_to_its_own_type_only() {
        let payload = Payload::new(Deposit { amount: 10 });

        assert!(payload.is::<Deposit>());
        assert_eq!(payload.downcast_ref::<Deposit>(), Some(&Deposit { amount: 10 }));
        assert_eq!(payload.downcast::<Deposit>().map(|d| d.amount), Some(10));
        assert!(payload.downcast_ref::<u32>().is_none());
        assert_eq!(payload.key(), HandlerKey::of::<Deposit>());
    }

    #[test]
    fn cloned_payloads_share_the_value() {
        let payload = Payload::new(Deposit { amount: 1 });
        let clone = payload.clone();

        let first = payload.downcast::<Deposit>().expect("deposit");
        let second = clone.downcast::<Deposit>().expect("deposit");

        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn ensure_routable_rejects_primitives() {
        let payload = Payload::new(42_u32);

        let result = payload.ensure_routable();

        assert!(matches!(
            result,
            Err(BusError::InvalidPayload {
                shape: PayloadShape::Primitive,
                ..
            })
        ));
    }

    #[test]
    fn ensure_routable_rejects_nil_pointers() {
        let payload = Payload::new(None::<Deposit>);

        assert!(matches!(payload.ensure_routable(), Err(BusError::NilPayload(_))));
        assert!(Payload::new(Some(Deposit { amount: 3 })).ensure_routable().is_ok());
    }

    #[test]
    fn shared_optional_payload_keeps_its_nil_flag() {
        let payload = Payload::from_arc(Arc::new(None::<Deposit>));

        assert!(payload.is_nil());
        assert!(!Payload::from_arc(Arc::new(Some(Deposit { amount: 1 }))).is_nil());
    }

    #[test]
    fn reply_round_trips_its_value() {
        let reply = Reply::new(Deposit { amount: 7 });

        assert_eq!(reply.key(), HandlerKey::of::<Deposit>());
        assert_eq!(reply.downcast::<Deposit>().ok(), Some(Deposit { amount: 7 }));
    }

    #[test]
    fn reply_mismatch_hands_the_reply_back() {
        let reply = Reply::new(Deposit { amount: 7 });

        let back = reply.downcast::<String>().expect_err("mismatch");

        assert_eq!(back.downcast_ref::<Deposit>(), Some(&Deposit { amount: 7 }));
    }
}
