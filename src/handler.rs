//! Image Handler Boundary
//!
//! The shim loader does not parse, verify, or relocate executables itself;
//! that work belongs to the surrounding shim, which applies its own signature
//! policy and PE/COFF loader. This module defines the seam between the two.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use r_efi::efi;

/// The result of handing a raw image buffer to the [`ImageHandler`]: a
/// loaded, relocated, page-backed image ready for execution.
#[derive(Debug, Clone, Copy)]
pub struct HandledImage {
    /// Base of the page allocation backing the relocated image.
    pub memory: efi::PhysicalAddress,
    /// Number of pages in that allocation. Released through
    /// [`BootServices::free_pages`](crate::protocols::BootServices::free_pages)
    /// when the image is unloaded.
    pub pages: usize,
    /// Entry point inside the relocated image.
    pub entry_point: efi::ImageEntryPoint,
}

/// Verifies, loads, and relocates a raw image buffer.
///
/// Implementations must fill in `image_base` and `image_size` on the supplied
/// loaded-image view, allocate the backing pages, and return the allocation
/// together with the entry point. On failure they must release anything they
/// allocated themselves and return a diagnostic status, which the loader
/// propagates to its caller unchanged.
pub trait ImageHandler {
    /// Processes `buffer` into an executable image described by `image_info`.
    fn handle_image(
        &self,
        buffer: &[u8],
        image_info: &mut efi::protocols::loaded_image::Protocol,
    ) -> Result<HandledImage, efi::Status>;
}
