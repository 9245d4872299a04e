//! Device Path Utilities
//!
//! Minimal device path support for the shim loader: walking a
//! terminator-delimited path, computing its total size, and making an owned
//! copy whose lifetime is tied to the image record rather than to the
//! caller's buffer.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use alloc::{boxed::Box, vec::Vec};
use core::{mem, ptr::NonNull, slice};
use r_efi::efi;
use r_efi::efi::protocols::device_path;

/// Returns the length in bytes of a single device path node, as encoded in
/// the node's own header.
fn node_length(node: &device_path::Protocol) -> usize {
    u16::from_le_bytes(node.length) as usize
}

/// Iterator over the nodes of a device path, including the terminating
/// end-of-path node.
///
/// The input is assumed to be a well-formed, correctly terminated device
/// path; callers that receive paths from untrusted sources must bounds-check
/// them before walking. No validation is performed here.
pub struct DevicePathWalker {
    next: Option<NonNull<device_path::Protocol>>,
}

impl DevicePathWalker {
    /// Creates a walker starting at the head node of `path`.
    ///
    /// ## Safety
    ///
    /// `path` must point to a device path with a valid length header in every
    /// node and a terminating end-of-path node, and must remain valid for the
    /// lifetime of the walker.
    pub unsafe fn new(path: *const device_path::Protocol) -> Self {
        DevicePathWalker { next: NonNull::new(path as *mut device_path::Protocol) }
    }
}

impl Iterator for DevicePathWalker {
    type Item = NonNull<device_path::Protocol>;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        // Safety: construction contract guarantees the node is readable.
        let node = unsafe { current.as_ref() };
        if node.r#type == device_path::TYPE_END {
            self.next = None;
        } else {
            let length = node_length(node);
            debug_assert!(length >= mem::size_of::<device_path::Protocol>());
            let next = unsafe { current.as_ptr().cast::<u8>().add(length) };
            self.next = NonNull::new(next.cast());
        }
        Some(current)
    }
}

/// Returns the total size in bytes of the device path at `path`, including
/// the terminating end-of-path node.
///
/// ## Safety
///
/// Same contract as [`DevicePathWalker::new`].
pub unsafe fn device_path_size(path: *const device_path::Protocol) -> usize {
    let end = unsafe { DevicePathWalker::new(path) }
        .last()
        .map_or(path as usize, |node| node.as_ptr() as usize);
    end - (path as usize) + mem::size_of::<device_path::Protocol>()
}

/// Copies the full device path at `path` (terminator included) into an owned
/// boxed slice, byte for byte.
///
/// The copy is independent of the source: the caller may free or mutate its
/// buffer immediately after this returns. Allocation failure is reported as
/// [`efi::Status::OUT_OF_RESOURCES`].
///
/// ## Safety
///
/// Same contract as [`DevicePathWalker::new`].
pub unsafe fn copy_device_path_to_boxed_slice(
    path: *const device_path::Protocol,
) -> Result<Box<[u8]>, efi::Status> {
    let size = unsafe { device_path_size(path) };
    let mut copy = Vec::new();
    copy.try_reserve_exact(size).map_err(|_| efi::Status::OUT_OF_RESOURCES)?;
    copy.extend_from_slice(unsafe { slice::from_raw_parts(path.cast::<u8>(), size) });
    Ok(copy.into_boxed_slice())
}
