//! A minimal SOCKS5 dialer.
//!
//! Implements just enough of RFC 1928 to open a CONNECT stream through
//! the overlay daemon's SOCKS5 port: no authentication negotiation
//! beyond "no authentication required", and domain-name addressing
//! (the daemon resolves hostnames itself, which is what lets it steer
//! the connection onto a circuit we've attached via the control port).

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::time::Duration;
use log::debug;

const VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const RSV: u8 = 0x00;

/// Opens a TCP connection to `(host, port)` through a SOCKS5 proxy
/// listening on `socks_host:socks_port`, applying `timeout` to every
/// read and write along the way. No retries: a single failed step
/// fails the whole dial.
pub fn dial(
    socks_host: &str, socks_port: u16,
    host: &str, port: u16,
    timeout: Duration,
) -> io::Result<TcpStream> {
    let stream = TcpStream::connect((socks_host, socks_port))?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;
    let mut stream = stream;

    negotiate_method(&mut stream)?;
    request_connect(&mut stream, host, port)?;
    debug!("SOCKS5 connected to {}:{} via {}:{}", host, port, socks_host, socks_port);
    Ok(stream)
}

fn negotiate_method(stream: &mut TcpStream) -> io::Result<()> {
    stream.write_all(&[VERSION, 1, METHOD_NO_AUTH])?;
    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply)?;
    if reply[0] != VERSION {
        return Err(proxy_error("unexpected SOCKS version in method reply"))
    }
    if reply[1] != METHOD_NO_AUTH {
        return Err(proxy_error("proxy demanded an unsupported auth method"))
    }
    Ok(())
}

fn request_connect(stream: &mut TcpStream, host: &str, port: u16) -> io::Result<()> {
    if host.len() > 255 {
        return Err(proxy_error("target host name too long for SOCKS5"))
    }
    let mut request = vec![VERSION, CMD_CONNECT, RSV, ATYP_DOMAIN, host.len() as u8];
    request.extend_from_slice(host.as_bytes());
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request)?;

    let mut header = [0u8; 4];
    stream.read_exact(&mut header)?;
    if header[0] != VERSION {
        return Err(proxy_error("unexpected SOCKS version in connect reply"))
    }
    if header[1] != 0x00 {
        return Err(general_proxy_error(header[1]))
    }
    // Skip the bound address the proxy echoes back: it varies in length
    // by address type and we have no use for it.
    match header[3] {
        0x01 => { let mut buf = [0u8; 4 + 2]; stream.read_exact(&mut buf)?; }
        0x04 => { let mut buf = [0u8; 16 + 2]; stream.read_exact(&mut buf)?; }
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len)?;
            let mut buf = vec![0u8; len[0] as usize + 2];
            stream.read_exact(&mut buf)?;
        }
        other => return Err(proxy_error(&format!("unknown bound address type {other}"))),
    }
    Ok(())
}

fn proxy_error(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::Other, format!("SOCKS5 proxy-connect error: {msg}"))
}

fn general_proxy_error(code: u8) -> io::Error {
    let reason = match code {
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown SOCKS5 error",
    };
    io::Error::new(
        io::ErrorKind::Other, format!("SOCKS5 general proxy error: {reason}")
    )
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn full_handshake_against_a_fake_proxy() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut method_req = [0u8; 3];
            sock.read_exact(&mut method_req).unwrap();
            sock.write_all(&[VERSION, METHOD_NO_AUTH]).unwrap();

            let mut head = [0u8; 5];
            sock.read_exact(&mut head).unwrap();
            let host_len = head[4] as usize;
            let mut rest = vec![0u8; host_len + 2];
            sock.read_exact(&mut rest).unwrap();
            let host = String::from_utf8(rest[..host_len].to_vec()).unwrap();
            assert_eq!(host, "echo.example.org");

            sock.write_all(&[VERSION, 0x00, RSV, 0x01, 0, 0, 0, 0, 0, 0]).unwrap();
        });

        dial(
            &addr.ip().to_string(), addr.port(),
            "echo.example.org", 16667,
            Duration::from_secs(2)
        ).unwrap();
        server.join().unwrap();
    }

    #[test]
    fn rejects_oversized_hostname() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut stream = TcpStream::connect(addr).unwrap();
        let err = request_connect(&mut stream, &"x".repeat(300), 80);
        assert!(err.is_err());
    }
}
