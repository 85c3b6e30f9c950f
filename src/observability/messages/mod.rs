// SPDX-License-Identifier: MIT

pub mod marshal;
pub mod session;
pub mod tier;
