// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

pub mod cluster;
pub mod dispatchers;
pub mod run_jobd;
pub mod transport;
