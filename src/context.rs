//! Entry Point Execution Context
//!
//! Each start operation runs the image entry point on a dedicated stack
//! inside a coroutine. The coroutine's yielder is the saved resume point: an
//! exit call from any depth of the entry point's call tree suspends the
//! coroutine, which lands control back at the `resume()` call in the start
//! operation with the exit status. The abandoned frames on the entry-point
//! stack never run again and are released together with the stack itself.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use alloc::vec::Vec;
use corosensei::stack::{Stack, StackPointer, MIN_STACK_SIZE, STACK_ALIGNMENT};
use r_efi::efi;

/// Stack size for image entry point execution.
pub(crate) const ENTRY_POINT_STACK_SIZE: usize = 0x100000;

/// A dedicated stack for running an image entry point.
///
/// The buffer is over-allocated by one alignment unit so that the base (the
/// highest address; stacks grow downward) can be aligned to
/// `STACK_ALIGNMENT` regardless of where the allocator placed it.
pub(crate) struct ImageStack {
    stack: Vec<u8>,
}

impl ImageStack {
    pub(crate) fn new(size: usize) -> Result<Self, efi::Status> {
        let len = size.max(MIN_STACK_SIZE) + STACK_ALIGNMENT;
        let mut stack = Vec::new();
        stack.try_reserve_exact(len).map_err(|_| efi::Status::OUT_OF_RESOURCES)?;
        stack.resize(len, 0);
        Ok(ImageStack { stack })
    }
}

unsafe impl Stack for ImageStack {
    fn base(&self) -> StackPointer {
        // Highest STACK_ALIGNMENT boundary inside the buffer.
        let top = self.stack.as_ptr() as usize + self.stack.len();
        StackPointer::new(top & !(STACK_ALIGNMENT - 1))
            .expect("aligned stack base is nonzero for any live allocation")
    }

    fn limit(&self) -> StackPointer {
        StackPointer::new(self.stack.as_ptr() as usize)
            .expect("stack buffer address is nonzero for any live allocation")
    }
}
