//! Platform Protocol Services
//!
//! The boundary between the shim loader and the platform firmware's handle
//! and protocol database, plus the pseudo-transactional multi-interface
//! install/uninstall built on top of it.
//!
//! `InstallMultipleProtocolInterfaces()` is C-variadic and cannot be called
//! from Rust, so the same guarantee — publish N interfaces on one handle, or
//! none of them — is reconstructed here from the single-interface primitives
//! with explicit, typed rollback.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use alloc::vec::Vec;
use core::ffi::c_void;
use core::ptr::{self, NonNull};
use r_efi::efi;

/// The slice of `EFI_BOOT_SERVICES` the shim loader needs.
///
/// Production code wraps the firmware's service table with
/// [`FirmwareBootServices`]; tests substitute a mock.
pub trait BootServices {
    /// Installs `interface` under `protocol` on `handle`, or on a freshly
    /// created handle when `handle` is `None`. Returns the handle the
    /// interface now lives on.
    fn install_protocol_interface(
        &self,
        handle: Option<efi::Handle>,
        protocol: &efi::Guid,
        interface: *mut c_void,
    ) -> Result<efi::Handle, efi::Status>;

    /// Removes `interface` under `protocol` from `handle`.
    fn uninstall_protocol_interface(
        &self,
        handle: efi::Handle,
        protocol: &efi::Guid,
        interface: *mut c_void,
    ) -> Result<(), efi::Status>;

    /// Looks up the interface published under `protocol` on `handle`
    /// (`OpenProtocol` with GET_PROTOCOL semantics; no usage is recorded
    /// against the handle).
    fn get_protocol(
        &self,
        handle: efi::Handle,
        protocol: &efi::Guid,
        agent: efi::Handle,
    ) -> Result<*mut c_void, efi::Status>;

    /// Releases a page allocation made on behalf of an image.
    fn free_pages(&self, memory: efi::PhysicalAddress, pages: usize) -> Result<(), efi::Status>;
}

/// [`BootServices`] implementation backed by the real firmware service table.
pub struct FirmwareBootServices {
    boot_services: NonNull<efi::BootServices>,
}

// Safety: boot services execute in the single-threaded firmware boot phase;
// there is no concurrent access to share unsoundly.
unsafe impl Sync for FirmwareBootServices {}
unsafe impl Send for FirmwareBootServices {}

impl FirmwareBootServices {
    /// Wraps the firmware's boot services table. Returns `None` for a null
    /// table pointer.
    ///
    /// ## Safety
    ///
    /// `boot_services` must point to a valid `EFI_BOOT_SERVICES` table that
    /// outlives the returned value.
    pub unsafe fn new(boot_services: *mut efi::BootServices) -> Option<Self> {
        NonNull::new(boot_services).map(|boot_services| FirmwareBootServices { boot_services })
    }

    fn table(&self) -> &efi::BootServices {
        // Safety: validity for the lifetime of self is the construction
        // contract.
        unsafe { self.boot_services.as_ref() }
    }
}

impl BootServices for FirmwareBootServices {
    fn install_protocol_interface(
        &self,
        handle: Option<efi::Handle>,
        protocol: &efi::Guid,
        interface: *mut c_void,
    ) -> Result<efi::Handle, efi::Status> {
        let mut handle = handle.unwrap_or(ptr::null_mut());
        let mut guid = *protocol;
        let status = (self.table().install_protocol_interface)(
            &mut handle,
            &mut guid,
            efi::NATIVE_INTERFACE,
            interface,
        );
        match status {
            efi::Status::SUCCESS => Ok(handle),
            err => Err(err),
        }
    }

    fn uninstall_protocol_interface(
        &self,
        handle: efi::Handle,
        protocol: &efi::Guid,
        interface: *mut c_void,
    ) -> Result<(), efi::Status> {
        let mut guid = *protocol;
        match (self.table().uninstall_protocol_interface)(handle, &mut guid, interface) {
            efi::Status::SUCCESS => Ok(()),
            err => Err(err),
        }
    }

    fn get_protocol(
        &self,
        handle: efi::Handle,
        protocol: &efi::Guid,
        agent: efi::Handle,
    ) -> Result<*mut c_void, efi::Status> {
        let mut guid = *protocol;
        let mut interface = ptr::null_mut();
        let status = (self.table().open_protocol)(
            handle,
            &mut guid,
            &mut interface,
            agent,
            ptr::null_mut(),
            efi::OPEN_PROTOCOL_GET_PROTOCOL,
        );
        match status {
            efi::Status::SUCCESS => Ok(interface),
            err => Err(err),
        }
    }

    fn free_pages(&self, memory: efi::PhysicalAddress, pages: usize) -> Result<(), efi::Status> {
        match (self.table().free_pages)(memory, pages) {
            efi::Status::SUCCESS => Ok(()),
            err => Err(err),
        }
    }
}

/// A staged multi-interface installation on a single handle.
///
/// Each successful [`install`](Self::install) records a rollback action.
/// Dropping the installation without [`commit`](Self::commit) uninstalls the
/// staged interfaces in reverse order, so a partial installation never leaks
/// into the protocol database.
pub struct ProtocolInstallation<'a> {
    services: &'a dyn BootServices,
    handle: efi::Handle,
    installed: Vec<(efi::Guid, *mut c_void)>,
}

impl<'a> ProtocolInstallation<'a> {
    /// Starts an empty installation; the handle is created by the first
    /// [`install`](Self::install).
    pub fn new(services: &'a dyn BootServices) -> Self {
        ProtocolInstallation { services, handle: ptr::null_mut(), installed: Vec::new() }
    }

    /// Stages `interface` under `protocol`, creating the handle if this is
    /// the first interface.
    pub fn install(&mut self, protocol: &efi::Guid, interface: *mut c_void) -> Result<(), efi::Status> {
        // Reserve the rollback slot first so bookkeeping cannot fail after
        // the platform call has succeeded.
        self.installed.try_reserve(1).map_err(|_| efi::Status::OUT_OF_RESOURCES)?;
        let handle = if self.handle.is_null() { None } else { Some(self.handle) };
        self.handle = self.services.install_protocol_interface(handle, protocol, interface)?;
        self.installed.push((*protocol, interface));
        Ok(())
    }

    /// Commits the staged interfaces and returns the handle they were
    /// published on (null if nothing was installed).
    pub fn commit(mut self) -> efi::Handle {
        self.installed.clear();
        self.handle
    }
}

impl Drop for ProtocolInstallation<'_> {
    fn drop(&mut self) {
        for (guid, interface) in self.installed.iter().rev() {
            if let Err(status) =
                self.services.uninstall_protocol_interface(self.handle, guid, *interface)
            {
                log::warn!("failed to roll back staged protocol interface: {status:?}");
            }
        }
    }
}

/// Removes a set of interfaces from `handle` as one unit.
///
/// If any removal fails, the interfaces removed so far are reinstalled and
/// the platform's status is returned; the database is left as it was found.
pub fn uninstall_protocol_interfaces(
    services: &dyn BootServices,
    handle: efi::Handle,
    interfaces: &[(efi::Guid, *mut c_void)],
) -> Result<(), efi::Status> {
    for (index, (guid, interface)) in interfaces.iter().enumerate() {
        if let Err(status) = services.uninstall_protocol_interface(handle, guid, *interface) {
            for (guid, interface) in interfaces[..index].iter().rev() {
                if let Err(status) =
                    services.install_protocol_interface(Some(handle), guid, *interface)
                {
                    log::warn!("failed to restore protocol interface after aborted removal: {status:?}");
                }
            }
            return Err(status);
        }
    }
    Ok(())
}
