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

#[macro_use]
extern crate tracing;

pub mod environment;
pub use environment::*;

pub mod inbound;
pub use inbound::*;

pub mod message;
pub use message::*;

pub mod nodes;
pub use nodes::*;

pub mod outbound;
pub use outbound::*;

pub mod transport;
pub use transport::*;
