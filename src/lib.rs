//! Transparent image loading and execution for a UEFI secure boot shim.
//!
//! The platform firmware's native `LoadImage()`/`StartImage()` services apply
//! the platform's own verification policy and loader quirks to any image they
//! are handed. A shim that needs to chain-load a second stage under its *own*
//! policy cannot use them, so this crate synthesizes the pieces itself: it
//! builds a private loaded-image record for a verified and relocated image,
//! publishes the standard `EFI_LOADED_IMAGE_PROTOCOL` and device-path
//! interfaces for it on a freshly created handle, and drives the image's
//! entry point through start/exit/unload operations that behave exactly like
//! the firmware's own.
//!
//! The delicate part is `Exit()`: a running image may terminate itself from
//! arbitrary call depth, and control must come back to the `StartImage()`
//! caller as if the entry point had returned. The entry point therefore runs
//! on its own stack inside a coroutine, and `Exit()` performs the non-local
//! transfer by suspending that coroutine with the exit status. Frames between
//! the entry point and the exit call are abandoned without cleanup, matching
//! the firmware contract.
//!
//! Image verification, PE/COFF loading, relocation, and page allocation are
//! not implemented here; they are delegated to an [`ImageHandler`]
//! implementation supplied by the surrounding shim.
//!
//! [`ImageHandler`]: crate::handler::ImageHandler
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod context;
pub mod device_path;
pub mod handler;
pub mod image;
pub mod protocols;

#[cfg(test)]
mod test_support;

pub use handler::{HandledImage, ImageHandler};
pub use image::{install_image, loader_protocol, LoaderProtocol, LOADER_PROTOCOL_GUID};
pub use protocols::{BootServices, FirmwareBootServices};
