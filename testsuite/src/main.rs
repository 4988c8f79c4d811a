// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Runs the BSP scenario suite on the host.
//!
//! Set `RUST_LOG` to see what the tasks are doing.

fn main() {
    env_logger::init();
    llbsp_testsuite::run_test_suite();
}
