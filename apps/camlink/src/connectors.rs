//! Physical channels: a local serial device or a serial-over-TCP bridge.

use std::io;
use std::path::PathBuf;

use camlink_link::{BoxedReader, BoxedWriter, ConnectFuture, Connector};

use crate::config::LinkSection;

/// Picks the connector named by the `[link]` section.
pub fn from_config(link: &LinkSection) -> Box<dyn Connector> {
    match &link.tcp {
        Some(addr) => Box::new(TcpConnector::new(addr.clone())),
        None => Box::new(SerialConnector::new(link.device.clone(), link.baud_rate)),
    }
}

/// TCP client to a serial bridge (ser2net and similar).
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

impl Connector for TcpConnector {
    fn connect(&self) -> ConnectFuture<'_> {
        Box::pin(async move {
            let stream = tokio::net::TcpStream::connect(&self.addr).await?;
            stream.set_nodelay(true)?;
            let (read, write) = stream.into_split();
            Ok((Box::new(read) as BoxedReader, Box::new(write) as BoxedWriter))
        })
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.addr)
    }
}

/// A tty opened in raw mode at a fixed speed.
pub struct SerialConnector {
    device: PathBuf,
    baud_rate: u32,
}

impl SerialConnector {
    pub fn new(device: impl Into<PathBuf>, baud_rate: u32) -> Self {
        Self {
            device: device.into(),
            baud_rate,
        }
    }
}

impl Connector for SerialConnector {
    fn connect(&self) -> ConnectFuture<'_> {
        let device = self.device.clone();
        let baud_rate = self.baud_rate;
        Box::pin(async move {
            let file = tokio::task::spawn_blocking(move || open_serial(&device, baud_rate))
                .await
                .map_err(io::Error::other)??;
            let writer = file.try_clone()?;
            Ok((
                Box::new(tokio::fs::File::from_std(file)) as BoxedReader,
                Box::new(tokio::fs::File::from_std(writer)) as BoxedWriter,
            ))
        })
    }

    fn describe(&self) -> String {
        format!("{}@{}", self.device.display(), self.baud_rate)
    }
}

#[cfg(unix)]
fn open_serial(device: &std::path::Path, baud_rate: u32) -> io::Result<std::fs::File> {
    use std::os::unix::fs::OpenOptionsExt;

    use nix::fcntl::OFlag;
    use nix::sys::termios::{self, ControlFlags, SetArg};

    let speed = baud_rate_for(baud_rate)?;
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(OFlag::O_NOCTTY.bits())
        .open(device)?;

    let mut attrs = termios::tcgetattr(&file).map_err(io::Error::from)?;
    termios::cfmakeraw(&mut attrs);
    attrs.control_flags |= ControlFlags::CLOCAL | ControlFlags::CREAD;
    termios::cfsetspeed(&mut attrs, speed).map_err(io::Error::from)?;
    termios::tcsetattr(&file, SetArg::TCSANOW, &attrs).map_err(io::Error::from)?;

    tracing::debug!(device = %device.display(), baud_rate, "serial port configured");
    Ok(file)
}

#[cfg(not(unix))]
fn open_serial(device: &std::path::Path, _baud_rate: u32) -> io::Result<std::fs::File> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("serial devices are not supported on this platform: {}", device.display()),
    ))
}

#[cfg(unix)]
fn baud_rate_for(rate: u32) -> io::Result<nix::sys::termios::BaudRate> {
    use nix::sys::termios::BaudRate;

    Ok(match rate {
        1200 => BaudRate::B1200,
        2400 => BaudRate::B2400,
        4800 => BaudRate::B4800,
        9600 => BaudRate::B9600,
        19200 => BaudRate::B19200,
        38400 => BaudRate::B38400,
        57600 => BaudRate::B57600,
        115200 => BaudRate::B115200,
        230400 => BaudRate::B230400,
        other => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unsupported baud rate {other}"),
            ));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn describe_endpoints() {
        assert_eq!(TcpConnector::new("bridge:7000").describe(), "tcp://bridge:7000");
        assert_eq!(
            SerialConnector::new("/dev/ttyS0", 115200).describe(),
            "/dev/ttyS0@115200"
        );
    }

    #[test]
    fn tcp_takes_precedence() {
        let link = LinkSection {
            tcp: Some("127.0.0.1:1".into()),
            ..LinkSection::default()
        };
        assert_eq!(from_config(&link).describe(), "tcp://127.0.0.1:1");
        assert_eq!(
            from_config(&LinkSection::default()).describe(),
            "/dev/ttyS0@9600"
        );
    }

    #[cfg(unix)]
    #[test]
    fn unsupported_baud_rate_is_rejected() {
        let err = baud_rate_for(12345).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(baud_rate_for(115200).is_ok());
    }

    #[tokio::test]
    async fn missing_device_fails_to_connect() {
        let tmp = tempfile::tempdir().unwrap();
        let connector = SerialConnector::new(tmp.path().join("ttyNONE"), 9600);
        assert!(connector.connect().await.is_err());
    }

    #[tokio::test]
    async fn tcp_connector_carries_bytes() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(b"PING\r\n").await.unwrap();
        });

        let (mut reader, _writer) = TcpConnector::new(addr.to_string()).connect().await.unwrap();
        let mut buf = [0u8; 6];
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"PING\r\n");
        server.await.unwrap();
    }
}
