//! Zero-copy plain-old-data casting, the way `object::pod` does it.
//!
//! The teacher crate implements its own minimal `Pod` trait instead of
//! depending on `bytemuck` (the workspace variant in
//! `examples/AlexeyTolstopyatov-os2omf/Cargo.toml` does pull in `bytemuck`,
//! but that crate is a pure field-layout description with no read/write
//! pipeline; once you need a `ReadRef`-generic streaming reader the way this
//! crate does, rolling the trait avoids a hard dependency on bytemuck's
//! derive macro for every fixed-size wire header). Safety is the same as
//! `object`'s: `unsafe impl Pod` asserts the type has no padding, no
//! `Drop`, and is valid for any bit pattern.

use core::mem;
use core::slice;

/// A type that can be safely reinterpreted from an arbitrary byte pattern.
///
/// # Safety
/// Implementors must have no padding bytes, no interior pointers, and be
/// valid for every bit pattern of their size.
pub unsafe trait Pod: Copy + 'static {}

/// Cast a byte slice to `&T`, requiring exact size and alignment.
pub fn from_bytes<T: Pod>(data: &[u8]) -> Option<(&T, &[u8])> {
    let size = mem::size_of::<T>();
    if data.len() < size || (data.as_ptr() as usize) % mem::align_of::<T>() != 0 {
        return None;
    }
    let (head, tail) = data.split_at(size);
    // SAFETY: `head` is exactly `size_of::<T>()` bytes, correctly aligned,
    // and `T: Pod` guarantees any bit pattern is valid.
    let value = unsafe { &*(head.as_ptr() as *const T) };
    Some((value, tail))
}

/// Cast a byte slice to `&[T]` of the requested element count.
pub fn slice_from_bytes<T: Pod>(data: &[u8], count: usize) -> Option<(&[T], &[u8])> {
    let size = mem::size_of::<T>().checked_mul(count)?;
    if data.len() < size || (data.as_ptr() as usize) % mem::align_of::<T>() != 0 {
        return None;
    }
    let (head, tail) = data.split_at(size);
    // SAFETY: see `from_bytes`; `count` elements fit exactly in `head`.
    let value = unsafe { slice::from_raw_parts(head.as_ptr() as *const T, count) };
    Some((value, tail))
}

/// View any `Pod` value as its raw bytes, used by writers emitting fixed
/// headers (`object::pod::bytes_of`, used throughout `write::elf`/`write::coff`).
pub fn bytes_of<T: Pod>(value: &T) -> &[u8] {
    // SAFETY: `T: Pod` guarantees no padding and a stable bit pattern.
    unsafe { slice::from_raw_parts(value as *const T as *const u8, mem::size_of::<T>()) }
}

macro_rules! impl_pod_for_primitives {
    ($($t:ty),* $(,)?) => {
        $(
            // SAFETY: primitive integer/byte types have no padding and are
            // valid for every bit pattern.
            unsafe impl Pod for $t {}
        )*
    };
}

impl_pod_for_primitives!(u8, i8, u16, i16, u32, i32, u64, i64);

unsafe impl<T: Pod, const N: usize> Pod for [T; N] {}
