//! The small trait vocabulary shared by all handle types.
//!
//! [`SignalRead`] is the value-access surface of signal-shaped handles;
//! [`Dependency`]/[`Dependencies`] let constructors accept "anything with a
//! node behind it" (including heterogeneous tuples of handles) as an input
//! list; [`AsStream`] is the equivalent conversion for stream-shaped
//! handles.

use crate::domain::DomainInner;
use crate::graph::NodeId;
use crate::stream::EventStream;
use std::sync::Weak;

/// An opaque reference to a node: its id plus the domain it lives in.
#[derive(Clone)]
pub struct DepRef {
    pub(crate) id: NodeId,
    pub(crate) domain: Weak<DomainInner>,
}

impl DepRef {
    pub(crate) fn domain_key(&self) -> usize {
        self.domain.as_ptr() as usize
    }
}

/// Anything that can appear in a node's input list.
pub trait Dependency {
    /// The node behind this handle.
    fn dep_ref(&self) -> DepRef;
}

impl<D: Dependency> Dependency for &D {
    fn dep_ref(&self) -> DepRef {
        (**self).dep_ref()
    }
}

/// A whole input list: a single handle reference, a tuple of handle
/// references, or a prebuilt `Vec<DepRef>`.
pub trait Dependencies {
    /// The nodes this list names, in declaration order.
    fn dep_refs(&self) -> Vec<DepRef>;
}

impl Dependencies for () {
    fn dep_refs(&self) -> Vec<DepRef> {
        Vec::new()
    }
}

impl Dependencies for Vec<DepRef> {
    fn dep_refs(&self) -> Vec<DepRef> {
        self.clone()
    }
}

impl<D: Dependency> Dependencies for &D {
    fn dep_refs(&self) -> Vec<DepRef> {
        vec![self.dep_ref()]
    }
}

macro_rules! impl_dependencies_for_tuple {
    ($($ty:ident),+) => {
        impl<'a, $($ty: Dependency),+> Dependencies for ($(&'a $ty,)+) {
            fn dep_refs(&self) -> Vec<DepRef> {
                #[allow(non_snake_case)]
                let ($($ty,)+) = self;
                vec![$($ty.dep_ref()),+]
            }
        }
    };
}

impl_dependencies_for_tuple!(A);
impl_dependencies_for_tuple!(A, B);
impl_dependencies_for_tuple!(A, B, C);
impl_dependencies_for_tuple!(A, B, C, D);
impl_dependencies_for_tuple!(A, B, C, D, E);
impl_dependencies_for_tuple!(A, B, C, D, E, F);
impl_dependencies_for_tuple!(A, B, C, D, E, F, G);
impl_dependencies_for_tuple!(A, B, C, D, E, F, G, H);

/// Value access on signal-shaped handles.
///
/// Reads always observe a consistent snapshot: outside a turn this is the
/// last committed value, and inside a turn the scheduler guarantees every
/// input has settled before a dependent computation reads it.
pub trait SignalRead<T>: Dependency {
    /// Applies `f` to the current value.
    fn with<U>(&self, f: impl FnOnce(&T) -> U) -> U;

    /// Clones the current value out.
    fn get(&self) -> T
    where
        T: Clone,
    {
        self.with(T::clone)
    }
}

/// Conversion to the common stream handle; implemented by event sources,
/// merges, and derived streams alike.
pub trait AsStream<T>: Dependency {
    /// A handle to this node viewed as an event stream.
    fn as_stream(&self) -> EventStream<T>;
}
