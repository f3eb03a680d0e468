// SPDX-License-Identifier: Apache-2.0

pub mod checkpoint;
pub mod coordinator;
pub mod error;
pub mod event;
pub mod init;
pub mod metrics;
pub mod publish;
pub mod source;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;
pub mod worker;
