// SPDX-License-Identifier: MIT

// Tests generated by build.rs, one per descriptor in tests/data.
include!(concat!(env!("OUT_DIR"), "/test-report-descriptors.rs"));
