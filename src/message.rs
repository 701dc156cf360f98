//! # Message and Multi-part Message
//!
//! A [`Message`] is a reference to a contiguous byte range plus an
//! ownership discipline. It is the zero-copy currency of the framework:
//! depending on how it was constructed, a `Message` may own a private
//! allocation, point at a `'static` buffer that is never freed, adopt a
//! caller-provided pointer with a release callback, or reference a
//! sub-range of an [`UnmanagedRegion`](crate::region::UnmanagedRegion).
//!
//! ## Ownership Invariants
//!
//! - A message's size is fixed once it has been handed to a transport for
//!   sending.
//! - The data pointer remains valid until the last transport reference to
//!   the message drops.
//! - A received message owns its payload until it is dropped.
//! - Sending a message across a transport other than the one it was built
//!   for performs an implicit copy ([`Message::copy_for_transport`]); it
//!   never reinterprets foreign memory.
//!
//! Grounded on the original `FairMQMessage` (`zmq_msg_init*`/`CleanUp`
//! pattern) and on `ipc::Message` from the teacher crate, recast here as
//! an ownership-tagged sum type per the re-architecture notes.

use crate::region::{RegionHandle, RegionTag};
use std::fmt;
use std::sync::Arc;

/// A release callback invoked exactly once after the last transport use of
/// an adopted buffer: `(ptr, hint) -> ()`. Must be `Send + Sync` because
/// the owning message may be dropped from a transport worker thread other
/// than the one that created it.
pub type FreeFn = Arc<dyn Fn(*mut u8, usize, Option<&str>) + Send + Sync>;

struct Adopted {
    ptr: *mut u8,
    len: usize,
    hint: Option<String>,
    free: FreeFn,
}

// SAFETY: the pointer is only dereferenced through `AdoptedMessage::as_slice`,
// which requires `&self`, and ownership of the pointed-to memory is released
// exactly once by `free` on drop. The caller who constructed the pointer is
// responsible for it being valid for as long as a `Message` references it.
unsafe impl Send for Adopted {}
unsafe impl Sync for Adopted {}

impl Drop for Adopted {
    fn drop(&mut self) {
        (self.free)(self.ptr, self.len, self.hint.as_deref());
    }
}

/// A message built from a sub-range of an [`UnmanagedRegion`](crate::region::UnmanagedRegion).
///
/// Unlike [`Adopted`], no per-message release callback fires when this
/// drops: the region batches "no longer needed" sub-ranges and invokes its
/// own bulk callback instead (§4.7). The region is kept alive for at least
/// as long as this handle exists via [`RegionHandle`]'s `Arc`.
struct InRegion {
    region: RegionHandle,
    offset: usize,
    len: usize,
    hint: Option<String>,
}

impl Drop for InRegion {
    fn drop(&mut self) {
        self.region.release(self.offset, self.len, self.hint.as_deref());
    }
}

/// A reference to a contiguous byte range with one of four ownership
/// disciplines (§3 Data Model).
pub enum Message {
    /// Placeholder for receive; carries no payload until filled in.
    Empty,
    /// Transport-owned allocation of a fixed size.
    Owned(Box<[u8]>),
    /// Caller-provided `'static` buffer that is never freed.
    Static(&'static [u8]),
    /// Caller-provided pointer with a release callback invoked exactly once.
    Adopted(Adopted),
    /// A sub-range of an unmanaged region.
    InRegion(InRegion),
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Empty => write!(f, "Message::Empty"),
            Message::Owned(b) => write!(f, "Message::Owned({} bytes)", b.len()),
            Message::Static(b) => write!(f, "Message::Static({} bytes)", b.len()),
            Message::Adopted(a) => write!(f, "Message::Adopted({} bytes)", a.len),
            Message::InRegion(r) => write!(f, "Message::InRegion({} bytes)", r.len),
        }
    }
}

impl Message {
    /// `NewMessage()`: an empty placeholder message, used as the receive
    /// destination before a transport fills it in.
    pub fn new_empty() -> Self {
        Message::Empty
    }

    /// `NewMessage(size)`: allocate `size` bytes of transport-owned storage.
    pub fn new_sized(size: usize) -> Self {
        Message::Owned(vec![0u8; size].into_boxed_slice())
    }

    /// `NewStaticMessage(data)`: wrap a `'static` buffer. Never freed,
    /// because the caller guarantees it outlives every use.
    pub fn new_static(data: &'static [u8]) -> Self {
        Message::Static(data)
    }

    /// `NewSimpleMessage(value)`: copy a small, trivially-copyable value
    /// into transport-owned storage. Always copies regardless of
    /// transport (see Open Question in §9): simplicity over a possible
    /// shared-memory fast path.
    pub fn new_simple<T: Copy>(value: T) -> Self {
        let size = std::mem::size_of::<T>();
        let mut buf = vec![0u8; size];
        // SAFETY: `T: Copy` guarantees no destructor and no interior
        // pointers that would be invalidated by a byte-wise copy.
        unsafe {
            std::ptr::copy_nonoverlapping(
                &value as *const T as *const u8,
                buf.as_mut_ptr(),
                size,
            );
        }
        Message::Owned(buf.into_boxed_slice())
    }

    /// `NewMessage(ptr, size, freeFn, hint)`: adopt a caller-provided
    /// buffer. `free` is invoked exactly once, after the last transport
    /// use, regardless of send success or failure.
    ///
    /// # Safety
    /// `ptr` must be valid for reads of `size` bytes for as long as any
    /// `Message` built from it is alive, and `free` must be safe to call
    /// with that pointer exactly once.
    pub unsafe fn new_adopted(ptr: *mut u8, size: usize, free: FreeFn, hint: Option<String>) -> Self {
        Message::Adopted(Adopted { ptr, len: size, hint, free })
    }

    /// Build a message referencing `len` bytes at `offset` within `region`.
    /// No per-message release callback runs; the region batches the
    /// "no longer needed" notification (§4.7).
    pub fn new_in_region(
        region: RegionHandle,
        offset: usize,
        len: usize,
        hint: Option<String>,
    ) -> Self {
        Message::InRegion(InRegion { region, offset, len, hint })
    }

    /// The originating region's tag, if this message was built from one.
    pub fn region_tag(&self) -> Option<RegionTag> {
        match self {
            Message::InRegion(r) => Some(r.region.tag()),
            _ => None,
        }
    }

    /// Byte length of the payload.
    pub fn len(&self) -> usize {
        match self {
            Message::Empty => 0,
            Message::Owned(b) => b.len(),
            Message::Static(b) => b.len(),
            Message::Adopted(a) => a.len,
            Message::InRegion(r) => r.len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Borrow the payload bytes. Empty messages return an empty slice.
    pub fn as_slice(&self) -> &[u8] {
        match self {
            Message::Empty => &[],
            Message::Owned(b) => b,
            Message::Static(b) => b,
            Message::Adopted(a) => unsafe { std::slice::from_raw_parts(a.ptr, a.len) },
            Message::InRegion(r) => r.region.as_slice(r.offset, r.len),
        }
    }

    /// Rebuild an empty message in place with transport-owned storage,
    /// mirroring `FairMQMessage::Rebuild`. Used by receive paths that
    /// start from a `NewMessage()` placeholder.
    pub fn rebuild_owned(&mut self, bytes: Vec<u8>) {
        *self = Message::Owned(bytes.into_boxed_slice());
    }

    /// Perform the implicit copy required when a message crosses into a
    /// transport other than the one it was built for (§3 invariant:
    /// "cross-transport send triggers an implicit copy, never UB").
    pub fn copy_for_transport(&self) -> Message {
        Message::Owned(self.as_slice().to_vec().into_boxed_slice())
    }
}

/// An ordered sequence of [`Message`]s transferred atomically: the
/// receiver either sees every part or none (§3). Must not be empty when
/// sent.
#[derive(Default)]
pub struct MultipartMessage {
    parts: Vec<Message>,
}

impl MultipartMessage {
    pub fn new() -> Self {
        Self { parts: Vec::new() }
    }

    pub fn push(&mut self, msg: Message) {
        self.parts.push(msg);
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Message> {
        self.parts.iter()
    }

    pub fn into_vec(self) -> Vec<Message> {
        self.parts
    }

    pub fn from_vec(parts: Vec<Message>) -> Self {
        Self { parts }
    }

    /// Total payload bytes across all parts, used by socket counters to
    /// attribute one multi-part transfer as one message but N bytes-worth
    /// of throughput (§4.4).
    pub fn total_bytes(&self) -> usize {
        self.parts.iter().map(Message::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn empty_message_has_zero_size() {
        let m = Message::new_empty();
        assert_eq!(m.len(), 0);
        assert!(m.is_empty());
    }

    #[test]
    fn sized_message_is_zeroed_and_correctly_sized() {
        let m = Message::new_sized(12);
        assert_eq!(m.len(), 12);
        assert_eq!(m.as_slice(), &[0u8; 12]);
    }

    #[test]
    fn simple_message_copies_the_value() {
        let m = Message::new_simple(1234u32);
        assert_eq!(m.len(), 4);
        assert_eq!(u32::from_ne_bytes(m.as_slice().try_into().unwrap()), 1234);
    }

    #[test]
    fn static_message_is_never_freed_and_borrows_data() {
        static DATA: [u8; 4] = [9, 9, 9, 9];
        let m = Message::new_static(&DATA);
        assert_eq!(m.as_slice(), &DATA);
    }

    #[test]
    fn adopted_message_invokes_free_exactly_once_on_drop() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let mut data = vec![1u8, 2, 3].into_boxed_slice();
        let ptr = data.as_mut_ptr();
        let len = data.len();
        std::mem::forget(data);

        let free: FreeFn = Arc::new(move |p, l, _hint| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            unsafe {
                drop(Vec::from_raw_parts(p, l, l));
            }
        });

        let m = unsafe { Message::new_adopted(ptr, len, free, None) };
        assert_eq!(m.as_slice(), &[1, 2, 3]);
        drop(m);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn multipart_rejects_being_empty_by_construction_contract() {
        let parts = MultipartMessage::new();
        assert!(parts.is_empty());
        // Sending an empty sequence is a caller error the socket layer
        // must refuse (§3); the type itself just reports emptiness.
    }

    #[test]
    fn multipart_total_bytes_sums_all_parts() {
        let mut parts = MultipartMessage::new();
        parts.push(Message::new_sized(4));
        parts.push(Message::new_sized(8));
        assert_eq!(parts.total_bytes(), 12);
    }

    #[test]
    fn copy_for_transport_produces_an_independent_owned_copy() {
        let m = Message::new_sized(4);
        let copy = m.copy_for_transport();
        assert_eq!(m.as_slice(), copy.as_slice());
        assert!(matches!(copy, Message::Owned(_)));
    }
}
