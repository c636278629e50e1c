use std::{fmt, net::SocketAddr, path::PathBuf};

use tokio::{
    fs::OpenOptions,
    io::{self, AsyncRead, AsyncWrite},
    net::TcpStream,
};
use tracing::info;

/// Byte stream the MCU is reachable over.
pub trait McuStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> McuStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type BoxedStream = Box<dyn McuStream>;

/// Where the MCU lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// A serial device node, already configured for line speed and raw mode.
    Serial(PathBuf),
    /// A TCP bridge or the development harness.
    Tcp(SocketAddr),
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Serial(path) => write!(f, "serial:{}", path.display()),
            Endpoint::Tcp(addr) => write!(f, "tcp:{addr}"),
        }
    }
}

impl Endpoint {
    pub async fn open(&self) -> io::Result<BoxedStream> {
        let stream: BoxedStream = match self {
            Endpoint::Serial(path) => {
                let file = OpenOptions::new().read(true).write(true).open(path).await?;
                Box::new(file)
            }
            Endpoint::Tcp(addr) => {
                let stream = TcpStream::connect(addr).await?;
                stream.set_nodelay(true)?;
                Box::new(stream)
            }
        };

        info!(endpoint = %self, "MCU transport open");
        Ok(stream)
    }
}
