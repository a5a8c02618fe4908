// hsmd is the single-threaded key-custody dispatcher of a Lightning-style
// payment node.
// Copyright (C) 2024  Himbeer <himbeerserverde@gmail.com>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Passing an open file descriptor over a Unix-domain socket via
//! `SCM_RIGHTS`, the mechanism `pass_client_hsmfd` in the reference
//! implementation uses to hand the master one end of a freshly created
//! socket pair immediately after acknowledging a `CLIENT_HSMFD` request.
//! `std` has no portable wrapper for ancillary data, so this goes straight
//! to `libc`, the same way the rest of the pack reaches for `libc` when it
//! needs a raw syscall `std` doesn't expose.

use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::os::unix::net::UnixStream;

use libc::{c_void, cmsghdr, iovec, msghdr};

/// Sends `fd` over `sock`, preceded by a single placeholder byte (some
/// kernels refuse to transmit ancillary data on an empty message).
pub fn send_fd(sock: &UnixStream, fd: RawFd) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let mut iov_base = [0u8; 1];
    let mut iov = iovec {
        iov_base: iov_base.as_mut_ptr() as *mut c_void,
        iov_len: iov_base.len(),
    };

    // Large enough for CMSG_SPACE(size_of::<RawFd>()) on every platform
    // `libc` supports; a single descriptor never comes close.
    let mut cmsg_buf = [0u8; 64];

    let mut msg: msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut c_void;
    msg.msg_controllen = unsafe { libc::CMSG_SPACE(mem::size_of::<RawFd>() as u32) as usize };

    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(mem::size_of::<RawFd>() as u32) as usize;
        std::ptr::write(libc::CMSG_DATA(cmsg) as *mut RawFd, fd);
    }

    let ret = unsafe { libc::sendmsg(sock.as_raw_fd(), &msg, 0) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

/// Receives a single file descriptor sent with [`send_fd`] from `sock`.
pub fn recv_fd(sock: &UnixStream) -> io::Result<RawFd> {
    use std::os::unix::io::AsRawFd;

    let mut iov_base = [0u8; 1];
    let mut iov = iovec {
        iov_base: iov_base.as_mut_ptr() as *mut c_void,
        iov_len: iov_base.len(),
    };

    let mut cmsg_buf = [0u8; 64];

    let mut msg: msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut c_void;
    msg.msg_controllen = cmsg_buf.len();

    let ret = unsafe { libc::recvmsg(sock.as_raw_fd(), &mut msg, 0) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    unsafe {
        let cmsg: *mut cmsghdr = libc::CMSG_FIRSTHDR(&msg);
        if cmsg.is_null() || (*cmsg).cmsg_type != libc::SCM_RIGHTS {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "expected an SCM_RIGHTS control message",
            ));
        }

        Ok(std::ptr::read(libc::CMSG_DATA(cmsg) as *const RawFd))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::FromRawFd;

    #[test]
    fn send_then_recv_round_trips_a_descriptor() {
        let (carrier_a, carrier_b) = UnixStream::pair().unwrap();
        let (payload_a, payload_b) = UnixStream::pair().unwrap();

        send_fd(&carrier_a, payload_b.as_raw_fd()).unwrap();
        drop(payload_b);

        let received = recv_fd(&carrier_b).unwrap();
        let received = unsafe { UnixStream::from_raw_fd(received) };

        payload_a.set_nonblocking(true).unwrap();
        received.set_nonblocking(true).unwrap();

        use std::io::Write;
        let mut writer = payload_a;
        writer.write_all(b"hello").unwrap();

        let mut buf = [0u8; 5];
        use std::io::Read;
        let mut reader = received;
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }
}
