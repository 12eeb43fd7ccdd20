// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! The client wire protocol: a self-delimiting binary item encoding (tagged
//! major types with minimum-width integer arguments) and the packet framing
//! built on top of it. Servers and clients exchange packets that are
//! top-level arrays of 4 (notification) or 6 (request/reply) items.

mod packet;
mod reader;
mod value;

pub use packet::{
    CodecError, NOTIFICATION_REQUEST_ID, Packet, PacketCodec, encode_notification, encode_request,
    packet_type,
};
pub use reader::{DecodeError, ItemReader, load_value};
pub use value::{
    Value, encode_array, encode_array_with_tail, v_bool, v_bytes, v_int, v_null, v_str,
};
