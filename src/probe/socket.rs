use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use crate::error::ProbeError;

/// Result of receiving an ICMP packet with TTL info
#[derive(Debug, Clone, Copy)]
pub struct RecvResult {
    pub len: usize,
    pub source: Ipv4Addr,
    /// TTL from the control message, when the kernel delivered one
    pub response_ttl: Option<u8>,
}

/// Send/receive side of one probe's ICMP socket.
///
/// Received packets start with the IPv4 header, as on a raw socket.
pub trait IcmpChannel {
    /// Set the TTL used for subsequent sends
    fn set_ttl(&mut self, ttl: u8) -> Result<(), ProbeError>;

    /// Send an encoded ICMP message to `target`
    fn send_to(&mut self, packet: &[u8], target: Ipv4Addr) -> Result<usize, ProbeError>;

    /// Block for at most `timeout` waiting for the next packet.
    /// `timeout` is never zero.
    fn recv(&mut self, buffer: &mut [u8], timeout: Duration) -> io::Result<RecvResult>;
}

/// Raw IPv4 ICMP socket bound to the wildcard address
#[derive(Debug)]
pub struct RawIcmpSocket {
    socket: Socket,
}

impl RawIcmpSocket {
    /// Open a raw ICMPv4 socket and enable TTL reception
    pub fn open() -> Result<Self, ProbeError> {
        let socket = create_raw_icmp_socket().map_err(ProbeError::SocketOpen)?;
        socket
            .bind(&SockAddr::from(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)))
            .map_err(ProbeError::SocketOpen)?;

        // Best-effort: the IP header TTL is used when no control message arrives
        #[cfg(unix)]
        if let Err(e) = enable_recv_ttl(&socket) {
            tracing::debug!(error = %e, "could not enable TTL reception");
        }

        Ok(Self { socket })
    }
}

impl IcmpChannel for RawIcmpSocket {
    fn set_ttl(&mut self, ttl: u8) -> Result<(), ProbeError> {
        self.socket
            .set_ttl(ttl as u32)
            .map_err(ProbeError::SocketOpen)
    }

    fn send_to(&mut self, packet: &[u8], target: Ipv4Addr) -> Result<usize, ProbeError> {
        let addr = SockAddr::from(SocketAddr::V4(SocketAddrV4::new(target, 0)));
        self.socket.send_to(packet, &addr).map_err(ProbeError::Write)
    }

    fn recv(&mut self, buffer: &mut [u8], timeout: Duration) -> io::Result<RecvResult> {
        self.socket.set_read_timeout(Some(timeout))?;
        recv_icmp_with_ttl(&self.socket, buffer)
    }
}

/// Create a raw ICMPv4 socket
pub fn create_raw_icmp_socket() -> io::Result<Socket> {
    let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4))?;
    socket.set_nonblocking(false)?;
    Ok(socket)
}

/// Check that raw ICMP sockets can be opened
pub fn check_permissions() -> Result<(), String> {
    if create_raw_icmp_socket().is_ok() {
        return Ok(());
    }

    let binary_path = std::env::current_exe()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| "quack".to_string());

    Err(format!(
        "Insufficient permissions for raw ICMP sockets.\n\n\
         Fix options:\n\
         \u{2022} Run with sudo: sudo quack <target>\n\
         \u{2022} Add capability: sudo setcap cap_net_raw+ep {}",
        binary_path
    ))
}

/// Enable IP_RECVTTL so recvmsg() returns the TTL of received packets
#[cfg(unix)]
fn enable_recv_ttl(socket: &Socket) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    #[cfg(target_os = "linux")]
    const IP_RECVTTL: libc::c_int = 12;
    #[cfg(not(target_os = "linux"))]
    const IP_RECVTTL: libc::c_int = 24;

    let val: libc::c_int = 1;
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_IP,
            IP_RECVTTL,
            &val as *const _ as *const libc::c_void,
            std::mem::size_of_val(&val) as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Receive an ICMP packet along with the TTL control message
#[cfg(unix)]
fn recv_icmp_with_ttl(socket: &Socket, buffer: &mut [u8]) -> io::Result<RecvResult> {
    use std::os::unix::io::AsRawFd;

    let mut iov = libc::iovec {
        iov_base: buffer.as_mut_ptr() as *mut libc::c_void,
        iov_len: buffer.len(),
    };
    let mut cmsg_buf = [0u8; 64];
    let mut src_storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_name = &mut src_storage as *mut _ as *mut libc::c_void;
    msg.msg_namelen = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    // msg_controllen type differs: usize on Linux, u32 on macOS
    msg.msg_controllen = cmsg_buf.len() as _;

    let len = unsafe { libc::recvmsg(socket.as_raw_fd(), &mut msg, 0) };
    if len < 0 {
        return Err(io::Error::last_os_error());
    }

    let source = parse_sockaddr_storage(&src_storage)?;
    let response_ttl = extract_ttl_from_cmsg(&msg);

    Ok(RecvResult {
        len: len as usize,
        source,
        response_ttl,
    })
}

/// Extract TTL from control message
#[cfg(unix)]
fn extract_ttl_from_cmsg(msg: &libc::msghdr) -> Option<u8> {
    // Linux delivers IP_TTL (2); macOS may deliver IP_TTL (4) or IP_RECVTTL (24)
    #[cfg(target_os = "linux")]
    fn is_ip_ttl_type(cmsg_type: libc::c_int) -> bool {
        cmsg_type == 2
    }
    #[cfg(not(target_os = "linux"))]
    fn is_ip_ttl_type(cmsg_type: libc::c_int) -> bool {
        cmsg_type == 4 || cmsg_type == 24
    }

    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(msg);
        while !cmsg.is_null() {
            let hdr = &*cmsg;
            if hdr.cmsg_level == libc::IPPROTO_IP && is_ip_ttl_type(hdr.cmsg_type) {
                let data_ptr = libc::CMSG_DATA(cmsg);
                // macOS IP_RECVTTL carries a single byte; Linux an int
                #[cfg(target_os = "linux")]
                let ttl = *(data_ptr as *const i32) as u8;
                #[cfg(not(target_os = "linux"))]
                let ttl = *data_ptr;
                return Some(ttl);
            }
            cmsg = libc::CMSG_NXTHDR(msg, cmsg);
        }
    }
    None
}

/// Parse sockaddr_storage to an IPv4 address
#[cfg(unix)]
fn parse_sockaddr_storage(storage: &libc::sockaddr_storage) -> io::Result<Ipv4Addr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let addr: &libc::sockaddr_in = unsafe { &*(storage as *const _ as *const _) };
            Ok(Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr)))
        }
        family => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unexpected address family: {}", family),
        )),
    }
}

/// Fallback for platforms without recvmsg(): no control message TTL
#[cfg(not(unix))]
fn recv_icmp_with_ttl(socket: &Socket, buffer: &mut [u8]) -> io::Result<RecvResult> {
    use std::mem::MaybeUninit;

    let uninit: &mut [MaybeUninit<u8>] = unsafe {
        std::slice::from_raw_parts_mut(buffer.as_mut_ptr() as *mut MaybeUninit<u8>, buffer.len())
    };
    let (len, addr) = socket.recv_from(uninit)?;
    let source = match addr.as_socket() {
        Some(SocketAddr::V4(v4)) => *v4.ip(),
        _ => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "unexpected address family",
            ));
        }
    };
    Ok(RecvResult {
        len,
        source,
        response_ttl: None,
    })
}
