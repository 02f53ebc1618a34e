//! Minimal rtnetlink client for link, address and route configuration.
//!
//! Messages are assembled by [`NlMessage`], a byte builder that keeps
//! attributes 4-byte aligned and patches nested attribute and header
//! lengths once their payload is known. The socket is bound in whichever
//! network namespace the calling thread is in when [`NetlinkHandle::new`]
//! runs.

use std::ffi::CString;
use std::io;
use std::mem;
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use capsule_common::error::{CapsuleError, Result};
use ipnetwork::Ipv4Network;

const NETLINK_ROUTE: i32 = 0;

const RTM_NEWLINK: u16 = 16;
const RTM_DELLINK: u16 = 17;
const RTM_NEWADDR: u16 = 20;
const RTM_NEWROUTE: u16 = 24;

const NLM_F_REQUEST: u16 = 0x0001;
const NLM_F_ACK: u16 = 0x0004;
const NLM_F_EXCL: u16 = 0x0200;
const NLM_F_CREATE: u16 = 0x0400;

const NLMSG_ERROR: u16 = 2;
const NLA_F_NESTED: u16 = 1 << 15;

const IFF_UP: u32 = 0x1;

const IFLA_IFNAME: u16 = 3;
const IFLA_MASTER: u16 = 10;
const IFLA_LINKINFO: u16 = 18;
const IFLA_NET_NS_FD: u16 = 28;
const IFLA_INFO_KIND: u16 = 1;
const IFLA_INFO_DATA: u16 = 2;
const VETH_INFO_PEER: u16 = 1;

const IFA_ADDRESS: u16 = 1;
const IFA_LOCAL: u16 = 2;

const RTA_OIF: u16 = 4;
const RTA_GATEWAY: u16 = 5;

const RT_TABLE_MAIN: u8 = 254;
const RTPROT_BOOT: u8 = 3;
const RT_SCOPE_UNIVERSE: u8 = 0;
const RTN_UNICAST: u8 = 1;

const AF_UNSPEC: u8 = 0;
const AF_INET: u8 = 2;

const HEADER_LEN: usize = 16;
const ATTR_HEADER_LEN: usize = 4;

const fn align4(len: usize) -> usize {
    (len + 3) & !3
}

/// Builder for a single rtnetlink request.
#[derive(Debug, Clone)]
pub struct NlMessage {
    msg_type: u16,
    flags: u16,
    buf: Vec<u8>,
    nests: Vec<usize>,
}

impl NlMessage {
    /// Starts a request of `msg_type` with the given header flags.
    #[must_use]
    pub fn new(msg_type: u16, flags: u16) -> Self {
        let mut buf = Vec::with_capacity(256);
        buf.resize(HEADER_LEN, 0);
        Self {
            msg_type,
            flags,
            buf,
            nests: Vec::new(),
        }
    }

    /// Appends an `ifinfomsg` body.
    #[must_use]
    pub fn ifinfo(mut self, index: i32, flags: u32, change: u32) -> Self {
        push_ifinfo(&mut self.buf, index, flags, change);
        self
    }

    /// Appends an `ifaddrmsg` body.
    #[must_use]
    pub fn ifaddr(mut self, prefix_len: u8, index: u32) -> Self {
        self.buf.extend_from_slice(&[AF_INET, prefix_len, 0, RT_SCOPE_UNIVERSE]);
        self.buf.extend_from_slice(&index.to_ne_bytes());
        self
    }

    /// Appends an `rtmsg` body for an IPv4 unicast route in the main table.
    #[must_use]
    pub fn rtmsg(mut self, dst_len: u8) -> Self {
        self.buf.extend_from_slice(&[
            AF_INET,
            dst_len,
            0,
            0,
            RT_TABLE_MAIN,
            RTPROT_BOOT,
            RT_SCOPE_UNIVERSE,
            RTN_UNICAST,
        ]);
        self.buf.extend_from_slice(&0_u32.to_ne_bytes());
        self
    }

    /// Appends a raw attribute, padded to 4 bytes.
    pub fn attr(&mut self, attr_type: u16, value: &[u8]) -> &mut Self {
        let len = ATTR_HEADER_LEN + value.len();
        self.push_attr_header(len, attr_type);
        self.buf.extend_from_slice(value);
        self.pad();
        self
    }

    /// Appends a NUL-terminated string attribute.
    pub fn attr_str(&mut self, attr_type: u16, value: &str) -> &mut Self {
        let mut bytes = Vec::with_capacity(value.len() + 1);
        bytes.extend_from_slice(value.as_bytes());
        bytes.push(0);
        self.attr(attr_type, &bytes)
    }

    /// Appends a native-endian `u32` attribute.
    pub fn attr_u32(&mut self, attr_type: u16, value: u32) -> &mut Self {
        self.attr(attr_type, &value.to_ne_bytes())
    }

    /// Opens a nested attribute; close it with [`Self::end_nested`].
    pub fn begin_nested(&mut self, attr_type: u16) -> &mut Self {
        self.nests.push(self.buf.len());
        self.push_attr_header(ATTR_HEADER_LEN, attr_type | NLA_F_NESTED);
        self
    }

    /// Closes the innermost nested attribute.
    pub fn end_nested(&mut self) -> &mut Self {
        if let Some(start) = self.nests.pop() {
            let len = u16::try_from(self.buf.len() - start).unwrap_or(u16::MAX);
            self.buf[start..start + 2].copy_from_slice(&len.to_ne_bytes());
        }
        self
    }

    /// Appends a bare `ifinfomsg`, as required inside `VETH_INFO_PEER`.
    pub fn raw_ifinfo(&mut self) -> &mut Self {
        push_ifinfo(&mut self.buf, 0, 0, 0);
        self
    }

    /// Finalises the header and returns the wire bytes.
    #[must_use]
    pub fn finish(mut self, seq: u32) -> Vec<u8> {
        while !self.nests.is_empty() {
            let _ = self.end_nested();
        }
        let len = u32::try_from(self.buf.len()).unwrap_or(u32::MAX);
        self.buf[0..4].copy_from_slice(&len.to_ne_bytes());
        self.buf[4..6].copy_from_slice(&self.msg_type.to_ne_bytes());
        self.buf[6..8].copy_from_slice(&self.flags.to_ne_bytes());
        self.buf[8..12].copy_from_slice(&seq.to_ne_bytes());
        self.buf[12..16].copy_from_slice(&0_u32.to_ne_bytes());
        self.buf
    }

    fn push_attr_header(&mut self, len: usize, attr_type: u16) {
        let len = u16::try_from(len).unwrap_or(u16::MAX);
        self.buf.extend_from_slice(&len.to_ne_bytes());
        self.buf.extend_from_slice(&attr_type.to_ne_bytes());
    }

    fn pad(&mut self) {
        self.buf.resize(align4(self.buf.len()), 0);
    }
}

fn push_ifinfo(buf: &mut Vec<u8>, index: i32, flags: u32, change: u32) {
    buf.extend_from_slice(&[AF_UNSPEC, 0]);
    buf.extend_from_slice(&0_u16.to_ne_bytes());
    buf.extend_from_slice(&index.to_ne_bytes());
    buf.extend_from_slice(&flags.to_ne_bytes());
    buf.extend_from_slice(&change.to_ne_bytes());
}

/// Request to create a bridge device.
#[must_use]
pub fn new_bridge_message(name: &str) -> NlMessage {
    let mut msg = NlMessage::new(RTM_NEWLINK, NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL)
        .ifinfo(0, 0, 0);
    let _ = msg.attr_str(IFLA_IFNAME, name);
    let _ = msg.begin_nested(IFLA_LINKINFO).attr_str(IFLA_INFO_KIND, "bridge").end_nested();
    msg
}

/// Request to create a veth pair, optionally enslaving `name` to `master`.
#[must_use]
pub fn new_veth_message(name: &str, peer: &str, master: Option<u32>) -> NlMessage {
    let mut msg = NlMessage::new(RTM_NEWLINK, NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL)
        .ifinfo(0, 0, 0);
    let _ = msg.attr_str(IFLA_IFNAME, name);
    if let Some(master) = master {
        let _ = msg.attr_u32(IFLA_MASTER, master);
    }
    let _ = msg
        .begin_nested(IFLA_LINKINFO)
        .attr_str(IFLA_INFO_KIND, "veth")
        .begin_nested(IFLA_INFO_DATA)
        .begin_nested(VETH_INFO_PEER)
        .raw_ifinfo()
        .attr_str(IFLA_IFNAME, peer)
        .end_nested()
        .end_nested()
        .end_nested();
    msg
}

/// Netlink socket handle for network configuration.
#[derive(Debug)]
pub struct NetlinkHandle {
    fd: OwnedFd,
    seq: u32,
}

impl NetlinkHandle {
    /// Opens and binds a `NETLINK_ROUTE` socket.
    ///
    /// # Errors
    ///
    /// Returns [`CapsuleError::Netlink`] if the socket cannot be created.
    pub fn new() -> Result<Self> {
        // SAFETY: plain socket(2) call; the result is checked before use.
        let raw = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                NETLINK_ROUTE,
            )
        };
        if raw < 0 {
            return Err(netlink_error("creating netlink socket", &io::Error::last_os_error()));
        }
        // SAFETY: `raw` is a fresh descriptor owned by nobody else.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        // SAFETY: zeroed sockaddr_nl is a valid "let the kernel pick" address.
        let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        // SAFETY: `addr` lives across the call and the length matches its type.
        let ret = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                std::ptr::addr_of!(addr).cast::<libc::sockaddr>(),
                mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(netlink_error("binding netlink socket", &io::Error::last_os_error()));
        }
        Ok(Self { fd, seq: 0 })
    }

    /// Creates a bridge device.
    ///
    /// # Errors
    ///
    /// Returns [`CapsuleError::Netlink`] if the kernel rejects the request,
    /// including when the name is taken.
    pub fn create_bridge(&mut self, name: &str) -> Result<()> {
        self.request(new_bridge_message(name), "creating bridge")
    }

    /// Creates a veth pair, enslaving `name` to `master` when given.
    ///
    /// # Errors
    ///
    /// Returns [`CapsuleError::Netlink`] if the kernel rejects the request.
    pub fn create_veth(&mut self, name: &str, peer: &str, master: Option<u32>) -> Result<()> {
        self.request(new_veth_message(name, peer, master), "creating veth pair")
    }

    /// Deletes a link by index.
    ///
    /// # Errors
    ///
    /// Returns [`CapsuleError::Netlink`] if the kernel rejects the request.
    pub fn delete_link(&mut self, index: u32) -> Result<()> {
        let msg = NlMessage::new(RTM_DELLINK, NLM_F_REQUEST | NLM_F_ACK).ifinfo(to_i32(index)?, 0, 0);
        self.request(msg, "deleting link")
    }

    /// Brings a link up.
    ///
    /// # Errors
    ///
    /// Returns [`CapsuleError::Netlink`] if the kernel rejects the request.
    pub fn set_link_up(&mut self, index: u32) -> Result<()> {
        let msg =
            NlMessage::new(RTM_NEWLINK, NLM_F_REQUEST | NLM_F_ACK).ifinfo(to_i32(index)?, IFF_UP, IFF_UP);
        self.request(msg, "setting link up")
    }

    /// Moves a link into the network namespace behind `netns_fd`.
    ///
    /// # Errors
    ///
    /// Returns [`CapsuleError::Netlink`] if the kernel rejects the request.
    pub fn set_link_netns(&mut self, index: u32, netns_fd: RawFd) -> Result<()> {
        let fd = u32::try_from(netns_fd).map_err(|_| CapsuleError::Netlink {
            message: format!("invalid namespace descriptor {netns_fd}"),
        })?;
        let mut msg = NlMessage::new(RTM_NEWLINK, NLM_F_REQUEST | NLM_F_ACK).ifinfo(to_i32(index)?, 0, 0);
        let _ = msg.attr_u32(IFLA_NET_NS_FD, fd);
        self.request(msg, "moving link to namespace")
    }

    /// Assigns `address` (with its prefix) to a link.
    ///
    /// An address that is already present is accepted.
    ///
    /// # Errors
    ///
    /// Returns [`CapsuleError::Netlink`] if the kernel rejects the request.
    pub fn add_address(&mut self, index: u32, address: Ipv4Network) -> Result<()> {
        let mut msg = NlMessage::new(RTM_NEWADDR, NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL)
            .ifaddr(address.prefix(), index);
        let octets = address.ip().octets();
        let _ = msg.attr(IFA_LOCAL, &octets).attr(IFA_ADDRESS, &octets);
        let seq = self.next_seq();
        match self.transact(&msg.finish(seq)) {
            Err(e) if e.raw_os_error() == Some(libc::EEXIST) => Ok(()),
            other => other.map_err(|e| netlink_error("adding address", &e)),
        }
    }

    /// Installs a default route via `gateway` out of link `index`.
    ///
    /// # Errors
    ///
    /// Returns [`CapsuleError::Netlink`] if the kernel rejects the request.
    pub fn add_default_route(&mut self, gateway: Ipv4Addr, index: u32) -> Result<()> {
        let mut msg =
            NlMessage::new(RTM_NEWROUTE, NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL).rtmsg(0);
        let _ = msg.attr(RTA_GATEWAY, &gateway.octets()).attr_u32(RTA_OIF, index);
        self.request(msg, "adding default route")
    }

    /// Looks up a link index by name in the socket's namespace.
    ///
    /// # Errors
    ///
    /// Returns [`CapsuleError::Netlink`] if the name contains a NUL byte.
    pub fn link_index(&self, name: &str) -> Result<Option<u32>> {
        let c_name = CString::new(name).map_err(|e| CapsuleError::Netlink {
            message: format!("invalid interface name {name:?}: {e}"),
        })?;
        // SAFETY: `c_name` is a valid NUL-terminated string for the call.
        let index = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
        Ok((index != 0).then_some(index))
    }

    /// Like [`Self::link_index`] but a missing link is an error.
    ///
    /// # Errors
    ///
    /// Returns [`CapsuleError::NotFound`] if no such link exists.
    pub fn require_link(&self, name: &str) -> Result<u32> {
        self.link_index(name)?.ok_or_else(|| CapsuleError::NotFound {
            kind: "link",
            id: name.to_string(),
        })
    }

    fn next_seq(&mut self) -> u32 {
        self.seq = self.seq.wrapping_add(1);
        self.seq
    }

    fn request(&mut self, msg: NlMessage, what: &str) -> Result<()> {
        let seq = self.next_seq();
        self.transact(&msg.finish(seq)).map_err(|e| netlink_error(what, &e))
    }

    /// Sends one request and waits for its acknowledgement.
    fn transact(&self, msg: &[u8]) -> io::Result<()> {
        // SAFETY: `msg` is a live slice for the duration of the call.
        let sent = unsafe { libc::send(self.fd.as_raw_fd(), msg.as_ptr().cast(), msg.len(), 0) };
        if sent < 0 {
            return Err(io::Error::last_os_error());
        }

        let mut buf = [0_u8; 4096];
        // SAFETY: `buf` is writable for its full length.
        let received = unsafe { libc::recv(self.fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len(), 0) };
        let received = usize::try_from(received).map_err(|_| io::Error::last_os_error())?;
        parse_ack(&buf[..received])
    }
}

/// Extracts the status of an `NLMSG_ERROR` acknowledgement.
fn parse_ack(reply: &[u8]) -> io::Result<()> {
    if reply.len() < HEADER_LEN {
        return Ok(());
    }
    let msg_type = u16::from_ne_bytes([reply[4], reply[5]]);
    if msg_type != NLMSG_ERROR || reply.len() < HEADER_LEN + 4 {
        return Ok(());
    }
    let code = i32::from_ne_bytes([reply[16], reply[17], reply[18], reply[19]]);
    if code == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(-code))
    }
}

fn to_i32(index: u32) -> Result<i32> {
    i32::try_from(index).map_err(|_| CapsuleError::Netlink {
        message: format!("interface index {index} out of range"),
    })
}

fn netlink_error(what: &str, e: &io::Error) -> CapsuleError {
    CapsuleError::Netlink {
        message: format!("{what}: {e}"),
    }
}
