// SPDX-License-Identifier: Apache-2.0

use opentelemetry::global;
use opentelemetry::metrics::Meter;

// Counters are no-ops until a MeterProvider is installed globally.
pub fn get_meter() -> Meter {
    global::meter("logship")
}
