// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Loggers for use during testing

use slog::o;
use slog::Drain;
use slog::Logger;

/// Return a logger that renders synchronously to the test-captured
/// stdout, tagged with the test's name.
pub fn test_logger(test_name: &'static str) -> Logger {
    let decorator =
        slog_term::PlainSyncDecorator::new(slog_term::TestStdoutWriter);
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    Logger::root(drain, o!("component" => test_name))
}
