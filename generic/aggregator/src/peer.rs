// SPDX-License-Identifier: MPL-2.0

//! Contracts of the elements linked before and after ours.

use crate::buffer::Buffer;
use crate::event::{Event, Query};
use crate::flow::FlowResult;

/// Receiver of our output.
pub trait Downstream: Send + Sync {
    fn chain(&self, buffer: Buffer) -> FlowResult;

    fn event(&self, event: Event) -> bool;

    fn query(&self, _query: &mut Query) -> bool {
        false
    }
}

/// Producer feeding one of our inputs, target of upstream events and queries.
pub trait Upstream: Send + Sync {
    fn event(&self, _event: Event) -> bool {
        false
    }

    fn query(&self, _query: &mut Query) -> bool {
        false
    }
}
