//! Shared mocks and fixtures for loader tests: an in-memory protocol
//! database, a scripted image handler, and device path construction helpers.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use crate::handler::{HandledImage, ImageHandler};
use crate::protocols::BootServices;
use core::cell::{Cell, RefCell};
use core::ffi::c_void;
use r_efi::efi;
use r_efi::efi::protocols::device_path;
use std::sync::Mutex;

/// Sub-type of the end-of-entire-path terminator node.
pub const END_ENTIRE_SUBTYPE: u8 = 0xff;

static GLOBAL_TEST_LOCK: Mutex<()> = Mutex::new(());

/// Runs `f` while holding the global test lock. Tests that communicate with
/// `extern "efiapi"` entry points through statics serialize on this.
pub fn with_global_lock<F: FnOnce()>(f: F) {
    let _guard = GLOBAL_TEST_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    f();
}

/// Builds a device path from `(type, sub_type, payload)` node triples and
/// appends the end-of-entire-path terminator.
pub fn build_device_path(nodes: &[(u8, u8, &[u8])]) -> Vec<u8> {
    let mut path = Vec::new();
    for (node_type, sub_type, payload) in nodes {
        path.push(*node_type);
        path.push(*sub_type);
        path.extend_from_slice(&((payload.len() + 4) as u16).to_le_bytes());
        path.extend_from_slice(payload);
    }
    path.extend_from_slice(&[device_path::TYPE_END, END_ENTIRE_SUBTYPE, 4, 0]);
    path
}

struct HandleEntry {
    handle: efi::Handle,
    interfaces: Vec<(efi::Guid, *mut c_void)>,
}

#[derive(Default)]
struct MockState {
    handles: Vec<HandleEntry>,
    next_handle: usize,
    installs: usize,
    fail_install_after: Option<usize>,
    fail_uninstall: Option<efi::Guid>,
    freed: Vec<(efi::PhysicalAddress, usize)>,
}

/// In-memory stand-in for the firmware handle and protocol database, with
/// failure injection on the install and uninstall paths and an account of
/// every page allocation released through it.
pub struct MockBootServices {
    state: RefCell<MockState>,
}

impl MockBootServices {
    pub fn new() -> Self {
        MockBootServices {
            state: RefCell::new(MockState { next_handle: 0x1000, ..Default::default() }),
        }
    }

    /// Leaks a fresh mock, for callers that need a `'static` reference.
    pub fn leak() -> &'static MockBootServices {
        Box::leak(Box::new(MockBootServices::new()))
    }

    /// Makes further installs fail with `OUT_OF_RESOURCES` once `successes`
    /// installs have gone through.
    pub fn fail_install_after(&self, successes: usize) {
        self.state.borrow_mut().fail_install_after = Some(successes);
    }

    /// Makes uninstalls of `protocol` fail with `ACCESS_DENIED`.
    pub fn fail_uninstall_of(&self, protocol: efi::Guid) {
        self.state.borrow_mut().fail_uninstall = Some(protocol);
    }

    pub fn fail_uninstall_of_none(&self) {
        self.state.borrow_mut().fail_uninstall = None;
    }

    /// The interface published under `protocol` on `handle`, if any.
    pub fn get(&self, handle: efi::Handle, protocol: &efi::Guid) -> Option<*mut c_void> {
        let state = self.state.borrow();
        let entry = state.handles.iter().find(|entry| entry.handle == handle)?;
        entry.interfaces.iter().find(|(guid, _)| guid == protocol).map(|(_, interface)| *interface)
    }

    /// Total interfaces across all handles.
    pub fn interface_count(&self) -> usize {
        self.state.borrow().handles.iter().map(|entry| entry.interfaces.len()).sum()
    }

    /// Live handles. A handle disappears with its last interface.
    pub fn handle_count(&self) -> usize {
        self.state.borrow().handles.len()
    }

    /// Every `free_pages` call observed, in order.
    pub fn freed_pages(&self) -> Vec<(efi::PhysicalAddress, usize)> {
        self.state.borrow().freed.clone()
    }
}

impl BootServices for MockBootServices {
    fn install_protocol_interface(
        &self,
        handle: Option<efi::Handle>,
        protocol: &efi::Guid,
        interface: *mut c_void,
    ) -> Result<efi::Handle, efi::Status> {
        let mut state = self.state.borrow_mut();
        if let Some(limit) = state.fail_install_after {
            if state.installs >= limit {
                return Err(efi::Status::OUT_OF_RESOURCES);
            }
        }
        state.installs += 1;
        let handle = match handle {
            Some(handle) => handle,
            None => {
                let fresh = state.next_handle as efi::Handle;
                state.next_handle += 0x10;
                fresh
            }
        };
        let index = match state.handles.iter().position(|entry| entry.handle == handle) {
            Some(index) => index,
            None => {
                state.handles.push(HandleEntry { handle, interfaces: Vec::new() });
                state.handles.len() - 1
            }
        };
        let entry = &mut state.handles[index];
        if entry.interfaces.iter().any(|(guid, _)| guid == protocol) {
            return Err(efi::Status::INVALID_PARAMETER);
        }
        entry.interfaces.push((*protocol, interface));
        Ok(handle)
    }

    fn uninstall_protocol_interface(
        &self,
        handle: efi::Handle,
        protocol: &efi::Guid,
        interface: *mut c_void,
    ) -> Result<(), efi::Status> {
        let mut state = self.state.borrow_mut();
        if state.fail_uninstall.as_ref() == Some(protocol) {
            return Err(efi::Status::ACCESS_DENIED);
        }
        let entry_index = state
            .handles
            .iter()
            .position(|entry| entry.handle == handle)
            .ok_or(efi::Status::NOT_FOUND)?;
        let entry = &mut state.handles[entry_index];
        let index = entry
            .interfaces
            .iter()
            .position(|(guid, stored)| guid == protocol && *stored == interface)
            .ok_or(efi::Status::NOT_FOUND)?;
        entry.interfaces.remove(index);
        if entry.interfaces.is_empty() {
            state.handles.remove(entry_index);
        }
        Ok(())
    }

    fn get_protocol(
        &self,
        handle: efi::Handle,
        protocol: &efi::Guid,
        _agent: efi::Handle,
    ) -> Result<*mut c_void, efi::Status> {
        self.get(handle, protocol).ok_or(efi::Status::UNSUPPORTED)
    }

    fn free_pages(&self, memory: efi::PhysicalAddress, pages: usize) -> Result<(), efi::Status> {
        self.state.borrow_mut().freed.push((memory, pages));
        Ok(())
    }
}

extern "efiapi" fn unused_entry_point(
    _handle: efi::Handle,
    _system_table: *mut efi::SystemTable,
) -> efi::Status {
    efi::Status::SUCCESS
}

/// Scripted [`ImageHandler`]: hands back a fixed allocation and entry point,
/// or a preset failure, and counts successful invocations.
pub struct MockImageHandler {
    pub memory: efi::PhysicalAddress,
    pub pages: usize,
    entry_point: efi::ImageEntryPoint,
    fail_with: Option<efi::Status>,
    handled: Cell<usize>,
}

impl MockImageHandler {
    pub fn new(entry_point: efi::ImageEntryPoint) -> Self {
        Self::with_allocation(0x20_0000, 4, entry_point)
    }

    pub fn with_allocation(
        memory: efi::PhysicalAddress,
        pages: usize,
        entry_point: efi::ImageEntryPoint,
    ) -> Self {
        MockImageHandler { memory, pages, entry_point, fail_with: None, handled: Cell::new(0) }
    }

    pub fn failing(status: efi::Status) -> Self {
        MockImageHandler { fail_with: Some(status), ..Self::new(unused_entry_point) }
    }

    /// Successful `handle_image` invocations so far.
    pub fn handled(&self) -> usize {
        self.handled.get()
    }
}

impl ImageHandler for MockImageHandler {
    fn handle_image(
        &self,
        _buffer: &[u8],
        image_info: &mut efi::protocols::loaded_image::Protocol,
    ) -> Result<HandledImage, efi::Status> {
        if let Some(status) = self.fail_with {
            return Err(status);
        }
        self.handled.set(self.handled.get() + 1);
        image_info.image_base = self.memory as usize as *mut c_void;
        image_info.image_size = (self.pages * 4096) as u64;
        Ok(HandledImage { memory: self.memory, pages: self.pages, entry_point: self.entry_point })
    }
}
