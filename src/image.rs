//! Shim Loader Image Services
//!
//! The per-image execution lifecycle: building the image record, publishing
//! its interfaces on a new handle, and the start/exit/unload operations the
//! shim exposes in place of the firmware's native image services.
//!
//! Three interfaces are published together on the image's handle: the
//! private loader operation set, the standard loaded-image view, and the
//! device-path view of the owned path copy. The loader interface is the
//! first field of the record, so the interface pointer handed out by the
//! protocol database doubles as the record pointer for internal dispatch.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use alloc::boxed::Box;
use core::ffi::c_void;
use core::ptr::{self, NonNull};
use core::slice;
use corosensei::{Coroutine, CoroutineResult, Yielder};
use r_efi::efi;
use r_efi::efi::protocols::{device_path, loaded_image, loaded_image_device_path};

use crate::context::{ImageStack, ENTRY_POINT_STACK_SIZE};
use crate::device_path::copy_device_path_to_boxed_slice;
use crate::handler::ImageHandler;
use crate::protocols::{uninstall_protocol_interfaces, BootServices, ProtocolInstallation};

/// Identifies the shim's private loader operation set on an image handle.
///
/// This GUID is private to the shim; the other two interfaces on the handle
/// use the standard loaded-image and loaded-image-device-path identifiers.
pub const LOADER_PROTOCOL_GUID: efi::Guid = efi::Guid::from_fields(
    0x915fc1fd,
    0x8a37,
    0x4a3d,
    0xa4,
    0x2e,
    &[0xd1, 0x10, 0xfc, 0x0d, 0x5a, 0xf0],
);

/// The loader operation set published under [`LOADER_PROTOCOL_GUID`].
///
/// Mirrors the firmware's `StartImage()`/`Exit()`/`UnloadImage()` services,
/// scoped to the one image whose handle carries the interface. The interface
/// is the first field of the image record, so `This` can be reinterpreted as
/// the record internally.
#[repr(C)]
pub struct LoaderProtocol {
    /// Transfers control to the image entry point. Returns the entry point's
    /// return status, or the status passed to [`exit`](Self::exit) if the
    /// image terminated itself. Optional out parameters receive the exit
    /// data the image attached, if any.
    pub start_image: extern "efiapi" fn(
        this: *mut LoaderProtocol,
        exit_data_size: *mut usize,
        exit_data: *mut *mut efi::Char16,
    ) -> efi::Status,
    /// Terminates the running image from any call depth. Does not return on
    /// success; control resumes at the `start_image` call that started the
    /// image. Ownership of the exit-data buffer passes to `start_image`'s
    /// caller.
    pub exit: extern "efiapi" fn(
        this: *mut LoaderProtocol,
        exit_status: efi::Status,
        exit_data_size: usize,
        exit_data: *mut efi::Char16,
    ) -> efi::Status,
    /// Removes the image's interfaces and releases its memory.
    pub unload_image: extern "efiapi" fn(this: *mut LoaderProtocol) -> efi::Status,
}

/// Exit data recorded by an exit call: byte size and caller-owned buffer.
struct ExitData(usize, *mut efi::Char16);

// Private state for one loaded image. The loader interface must stay the
// first field; see LoaderProtocol.
#[repr(C)]
struct PrivateImageData {
    loader: LoaderProtocol,
    image_info: loaded_image::Protocol,
    handle: efi::Handle,
    memory: efi::PhysicalAddress,
    pages: usize,
    entry_point: efi::ImageEntryPoint,
    started: bool,
    exit_data: Option<ExitData>,
    // Resume point for the exit path; Some only while started.
    start_context: Option<NonNull<Yielder<(), efi::Status>>>,
    services: &'static dyn BootServices,
    // Owned copy of the caller's device path; image_info.file_path points
    // into this buffer.
    device_path: Box<[u8]>,
}

// dummy function used to initialize PrivateImageData.entry_point.
extern "efiapi" fn unimplemented_entry_point(
    _handle: efi::Handle,
    _system_table: *mut efi::SystemTable,
) -> efi::Status {
    unimplemented!()
}

/// Loads `buffer` as an image and publishes it on a freshly created handle.
///
/// The device path is copied; the caller may release its own copy as soon as
/// this returns. Verification, relocation, and page allocation are delegated
/// to `handler`, whose failure status is propagated unchanged. On any
/// failure, everything acquired by this call is released before returning.
///
/// Returns the new handle, which carries the loader operation set, the
/// standard loaded-image view, and the device-path view.
///
/// ## Safety
///
/// `device_path` must point to a well-formed, terminated device path, and
/// `buffer` must be valid for reads of `size` bytes, for the duration of the
/// call. `system_table` is stored in the loaded-image view and passed to the
/// image entry point; it must remain valid for the life of the image.
pub unsafe fn install_image(
    services: &'static dyn BootServices,
    handler: &dyn ImageHandler,
    system_table: *mut efi::SystemTable,
    parent_handle: efi::Handle,
    device_path: *const device_path::Protocol,
    buffer: *const u8,
    size: usize,
) -> Result<efi::Handle, efi::Status> {
    if parent_handle.is_null() || device_path.is_null() || buffer.is_null() {
        return Err(efi::Status::INVALID_PARAMETER);
    }

    // Safety: caller contract guarantees a well-formed, terminated path.
    let path = unsafe { copy_device_path_to_boxed_slice(device_path) }?;
    let file_path = path.as_ptr() as *mut device_path::Protocol;

    let mut image = Box::new(PrivateImageData {
        loader: LoaderProtocol { start_image, exit: exit_image, unload_image },
        image_info: loaded_image::Protocol {
            revision: loaded_image::REVISION,
            parent_handle,
            system_table,
            device_handle: ptr::null_mut(),
            file_path,
            reserved: ptr::null_mut(),
            load_options_size: 0,
            load_options: ptr::null_mut(),
            image_base: ptr::null_mut(),
            image_size: 0,
            image_code_type: efi::LOADER_CODE,
            image_data_type: efi::LOADER_DATA,
            unload: None,
        },
        handle: ptr::null_mut(),
        memory: 0,
        pages: 0,
        entry_point: unimplemented_entry_point,
        started: false,
        exit_data: None,
        start_context: None,
        services,
        device_path: path,
    });

    // Verify and relocate the image. The handler cleans up its own partial
    // work on failure, so the record (and path copy) are all we drop here.
    // Safety: caller contract guarantees buffer validity.
    let source = unsafe { slice::from_raw_parts(buffer, size) };
    let handled = handler.handle_image(source, &mut image.image_info)?;
    image.memory = handled.memory;
    image.pages = handled.pages;
    image.entry_point = handled.entry_point;

    // Publish all three interfaces on one new handle as a unit. The record
    // moves behind a raw pointer first so the published interface pointers
    // stay stable.
    let image = Box::into_raw(image);
    let mut installation = ProtocolInstallation::new(services);
    let staged = (|| {
        installation.install(&LOADER_PROTOCOL_GUID, image.cast())?;
        installation.install(&loaded_image_device_path::PROTOCOL_GUID, file_path.cast())?;
        // Safety: image is live until Box::from_raw in the error arm below.
        installation
            .install(&loaded_image::PROTOCOL_GUID, unsafe { ptr::addr_of_mut!((*image).image_info) }.cast())
    })();

    match staged {
        Ok(()) => {
            let handle = installation.commit();
            // Safety: record is live; not yet reachable by any other caller.
            unsafe {
                (*image).handle = handle;
                log::debug!(
                    "installed image on handle {handle:?}: {} pages at {:#x}",
                    (*image).pages,
                    (*image).memory
                );
            }
            Ok(handle)
        }
        Err(status) => {
            // Uninstalls whatever was staged.
            drop(installation);
            // Safety: the record was never published; reclaim and release it
            // together with the image allocation it tracks.
            let image = unsafe { Box::from_raw(image) };
            if let Err(err) = services.free_pages(image.memory, image.pages) {
                log::warn!("failed to free image pages during install rollback: {err:?}");
            }
            Err(status)
        }
    }
}

/// Resolves the loader operation set from an image handle, if the handle
/// carries one.
pub fn loader_protocol(
    services: &dyn BootServices,
    handle: efi::Handle,
) -> Option<NonNull<LoaderProtocol>> {
    let interface = services.get_protocol(handle, &LOADER_PROTOCOL_GUID, handle).ok()?;
    NonNull::new(interface.cast())
}

// Runs the image entry point and reports its outcome: the entry point's own
// return status, or the status recorded by an exit call.
//
// Safety: image must point at a live record with no start in flight on it
// from the calling frame (re-entry is rejected via the started flag).
unsafe fn start(
    image: *mut PrivateImageData,
    exit_data_size: *mut usize,
    exit_data: *mut *mut efi::Char16,
) -> efi::Status {
    // Safety: live record per contract.
    if unsafe { (*image).started } {
        return efi::Status::ALREADY_STARTED;
    }

    let stack = match ImageStack::new(ENTRY_POINT_STACK_SIZE) {
        Ok(stack) => stack,
        Err(status) => return status,
    };

    // Safety: live record; no other execution touches it until the entry
    // point runs, and the entry point reaches it only through the exit
    // operation.
    unsafe {
        (*image).started = true;
        (*image).exit_data = None;
    }

    // The entry point runs as a coroutine on its own stack. The yielder
    // saved in the record is the resume point that an exit call, at any
    // depth of the entry point's call tree, transfers back to.
    let mut coroutine: Coroutine<(), efi::Status, efi::Status, ImageStack> =
        Coroutine::with_stack(stack, move |yielder, ()| {
            // Safety: the record outlives the coroutine; the starting frame
            // does not touch it again until resume() returns.
            let (entry_point, handle, system_table) = unsafe {
                (*image).start_context = Some(NonNull::from(yielder));
                ((*image).entry_point, (*image).handle, (*image).image_info.system_table)
            };
            entry_point(handle, system_table)
        });

    let status = match coroutine.resume(()) {
        // The entry point returned normally.
        CoroutineResult::Return(status) => status,
        // The image called exit(). The frames between the entry point and
        // the exit call are permanently abandoned; reset the coroutine so
        // dropping it does not try to unwind them.
        CoroutineResult::Yield(status) => {
            // Safety: the suspended frames hold nothing that may be resumed.
            unsafe { coroutine.force_reset() };
            status
        }
    };
    drop(coroutine);

    log::debug!("image entry point finished with status {status:?}");

    // Safety: the coroutine is gone; this frame owns the record again.
    unsafe {
        (*image).start_context = None;
        (*image).started = false;
        let ExitData(size, data) =
            (*image).exit_data.take().unwrap_or(ExitData(0, ptr::null_mut()));
        if !exit_data_size.is_null() {
            exit_data_size.write(size);
        }
        if !exit_data.is_null() {
            exit_data.write(data);
        }
    }
    status
}

// Records the exit status and data, then transfers control back to the start
// operation. Returns (with an error) only when no start is in flight.
//
// Safety: image must point at a live record.
unsafe fn exit(
    image: *mut PrivateImageData,
    exit_status: efi::Status,
    exit_data_size: usize,
    exit_data: *mut efi::Char16,
) -> efi::Status {
    // Safety: live record per contract.
    let context = unsafe {
        if !(*image).started {
            return efi::Status::NOT_STARTED;
        }
        (*image).exit_data = Some(ExitData(exit_data_size, exit_data));
        (*image).start_context.take()
    };

    if let Some(context) = context {
        // Control lands at the resume point in start(). Every frame between
        // the entry point and this call is abandoned: no further statements,
        // no Drop impls. Anything needing cleanup must be dropped before
        // calling exit.
        // Safety: the yielder lives on the coroutine stack, which is alive
        // while started is set.
        unsafe { context.as_ref() }.suspend(exit_status);
    }

    // A one-shot context is never resumed, so the transfer above does not
    // come back; reaching this point means the record had no saved context.
    efi::Status::ACCESS_DENIED
}

// Removes the image's interfaces, then releases its memory and the record.
//
// Safety: image must point at a live record; on success the record is gone
// and the pointer must not be used again.
unsafe fn unload(image: *mut PrivateImageData) -> efi::Status {
    // Safety: live record per contract.
    let (services, handle, interfaces, memory, pages) = unsafe {
        if (*image).started {
            // The C loader leaves unload-while-running undefined; report it
            // instead of tearing down a running image.
            return efi::Status::ACCESS_DENIED;
        }
        (
            (*image).services,
            (*image).handle,
            [
                (LOADER_PROTOCOL_GUID, image.cast::<c_void>()),
                (loaded_image_device_path::PROTOCOL_GUID, (*image).image_info.file_path.cast()),
                (loaded_image::PROTOCOL_GUID, ptr::addr_of_mut!((*image).image_info).cast()),
            ],
            (*image).memory,
            (*image).pages,
        )
    };

    // Interfaces come out of the database before any memory is released; a
    // failed removal leaves the image fully intact and published.
    if let Err(status) = uninstall_protocol_interfaces(services, handle, &interfaces) {
        log::warn!("unload of handle {handle:?} failed to remove interfaces: {status:?}");
        return status;
    }

    if let Err(status) = services.free_pages(memory, pages) {
        log::warn!("failed to free image pages for handle {handle:?}: {status:?}");
    }

    // Safety: the interfaces are gone, so nothing else refers to the record.
    drop(unsafe { Box::from_raw(image) });
    efi::Status::SUCCESS
}

extern "efiapi" fn start_image(
    this: *mut LoaderProtocol,
    exit_data_size: *mut usize,
    exit_data: *mut *mut efi::Char16,
) -> efi::Status {
    if this.is_null() {
        return efi::Status::INVALID_PARAMETER;
    }
    // Safety: the loader interface is the first field of the record.
    unsafe { start(this.cast::<PrivateImageData>(), exit_data_size, exit_data) }
}

extern "efiapi" fn exit_image(
    this: *mut LoaderProtocol,
    exit_status: efi::Status,
    exit_data_size: usize,
    exit_data: *mut efi::Char16,
) -> efi::Status {
    if this.is_null() {
        return efi::Status::INVALID_PARAMETER;
    }
    // Safety: the loader interface is the first field of the record.
    unsafe { exit(this.cast::<PrivateImageData>(), exit_status, exit_data_size, exit_data) }
}

extern "efiapi" fn unload_image(this: *mut LoaderProtocol) -> efi::Status {
    if this.is_null() {
        return efi::Status::INVALID_PARAMETER;
    }
    // Safety: the loader interface is the first field of the record.
    unsafe { unload(this.cast::<PrivateImageData>()) }
}
