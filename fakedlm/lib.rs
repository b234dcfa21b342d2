// This file is part of FakeDLM.

// FakeDLM is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// FakeDLM is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with FakeDLM. If not, see <https://www.gnu.org/licenses/>.

//! FakeDLM is a replacement for dlm_controld for testing purposes. It
//! assumes perfect network connectivity and is not intended or suitable
//! for controlling DLM in production use.
//!
//! Start FakeDLM with the same list of node names or addresses on every
//! node; the position in the list assigns the node id. The nodes connect
//! to each other and FakeDLM starts managing lockspace membership.

#[macro_use]
extern crate tracing;

pub mod cli;
pub use cli::*;

pub mod daemon;
pub use daemon::*;
