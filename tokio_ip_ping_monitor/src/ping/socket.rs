use super::packet::Decoder;
use super::{Family, Mode};
use socket2::{Domain, Protocol, SockAddr, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

/// Upper bound on how long a listener blocks in a single read.
pub const LISTEN_POLL: Duration = Duration::from_millis(250);

/// A connection probes are written to and replies are read from.
///
/// Writes come from the send pool while a listener thread reads, so both
/// take `&self`.
pub trait Socket: Send + Sync {
    fn family(&self) -> Family;
    /// Identifier replies to this connection carry.
    fn identifier(&self) -> u16;
    /// Whether reads start with the IPv4 header.
    fn header_included(&self) -> bool;
    fn send_to(&self, packet: &[u8], addr: IpAddr) -> io::Result<()>;
    /// Read one datagram and the canonical address of its sender.
    ///
    /// Returns an idle error (see [`is_idle`]) when nothing arrived within the
    /// poll interval.
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, Option<IpAddr>)>;

    fn decoder(&self) -> Decoder {
        Decoder::new(self.family(), self.identifier(), self.header_included())
    }
}

/// Identifier stamped on every probe of this process.
pub fn process_identifier() -> u16 {
    (std::process::id() & 0xffff) as u16
}

/// Read errors that only mean "nothing arrived yet".
pub fn is_idle(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

#[derive(Debug)]
pub struct IcmpSocket {
    inner: socket2::Socket,
    family: Family,
    mode: Mode,
    identifier: u16,
}

impl IcmpSocket {
    pub fn open(family: Family, mode: Mode, write_timeout: Duration) -> io::Result<Self> {
        let (domain, protocol, unspecified) = match family {
            Family::V4 => (
                Domain::IPV4,
                Protocol::ICMPV4,
                IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            ),
            Family::V6 => (
                Domain::IPV6,
                Protocol::ICMPV6,
                IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            ),
        };
        let ty = match mode {
            Mode::Privileged => Type::RAW,
            Mode::Unprivileged => Type::DGRAM,
        };
        let inner = socket2::Socket::new(domain, ty, Some(protocol))?;
        inner.set_read_timeout(Some(LISTEN_POLL))?;
        inner.set_write_timeout(Some(write_timeout))?;

        let mut identifier = process_identifier();
        if mode == Mode::Unprivileged {
            inner.bind(&SocketAddr::new(unspecified, 0).into())?;
            // Linux ping sockets overwrite the echo identifier with the bound port.
            let port = inner.local_addr()?.as_socket().map(|addr| addr.port());
            if let Some(port) = port.filter(|port| *port != 0) {
                identifier = port;
            }
        }

        Ok(Self {
            inner,
            family,
            mode,
            identifier,
        })
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }
}

impl Socket for IcmpSocket {
    fn family(&self) -> Family {
        self.family
    }

    fn identifier(&self) -> u16 {
        self.identifier
    }

    fn header_included(&self) -> bool {
        self.family == Family::V4
            && (self.mode == Mode::Privileged || cfg!(target_os = "macos"))
    }

    fn send_to(&self, packet: &[u8], addr: IpAddr) -> io::Result<()> {
        self.inner
            .send_to(packet, &SockAddr::from(SocketAddr::new(addr, 0)))
            .map(|_| ())
    }

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, Option<IpAddr>)> {
        self.inner
            .recv_from_into_buf(buf)
            .map(|(size, addr)| (size, addr.map(|addr| addr.ip().to_canonical())))
    }
}

/// `recv_from` into an initialised buffer, which `socket2::Socket` does not offer.
trait RecvFrom {
    fn recv_from_into_buf(&self, buf: &mut [u8]) -> io::Result<(usize, Option<SocketAddr>)>;
}

impl RecvFrom for socket2::Socket {
    // Safety: `recv_from` never writes uninitialised bytes into `buf`.
    #[allow(unsafe_code)]
    fn recv_from_into_buf(&self, buf: &mut [u8]) -> io::Result<(usize, Option<SocketAddr>)> {
        let buf = unsafe {
            &mut *(std::ptr::from_mut::<[u8]>(buf) as *mut [std::mem::MaybeUninit<u8>])
        };
        self.recv_from(buf)
            .map(|(size, addr)| (size, addr.as_socket()))
    }
}
