// Copyright 2025 The Axvisor Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use super::{GeneralRegisters, GuestContext};
use alloc::format;
use core::fmt::Debug;

/// The registers an exit handler changed, formatted as `old -> new` pairs.
pub struct GeneralRegistersDiff {
    old: GuestContext,
    new: GuestContext,
}

impl GeneralRegistersDiff {
    const INDEX_RANGE: core::ops::Range<u8> = 0..16;
    const RSP_INDEX: u8 = 4;

    /// Compares a guest context before and after an exit was handled.
    pub fn new(old: GuestContext, new: GuestContext) -> Self {
        GeneralRegistersDiff { old, new }
    }

    /// Returns `true` if the handler left every register untouched.
    pub fn is_same(&self) -> bool {
        self.old == self.new
    }
}

impl Debug for GeneralRegistersDiff {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        let mut debug = f.debug_struct("GeneralRegistersDiff");

        for i in Self::INDEX_RANGE {
            if i == Self::RSP_INDEX {
                continue;
            }

            let old = self.old.regs.get_reg_of_index(i);
            let new = self.new.regs.get_reg_of_index(i);

            if old != new {
                debug.field(
                    GeneralRegisters::register_name(i),
                    &format!("{old:#x} -> {new:#x}"),
                );
            }
        }

        for (name, old, new) in [
            ("rip", self.old.rip, self.new.rip),
            ("rsp", self.old.rsp, self.new.rsp),
            ("rflags", self.old.rflags, self.new.rflags),
        ] {
            if old != new {
                debug.field(name, &format!("{old:#x} -> {new:#x}"));
            }
        }

        debug.finish()
    }
}
