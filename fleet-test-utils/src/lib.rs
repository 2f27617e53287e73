// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Facilities for the fleet engine test suite
//!
//! These should not be used in production code.

pub mod log;
pub mod sim;
