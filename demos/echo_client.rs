use std::io::{Read, Write};
use std::net::TcpStream;

/// A bare `std::net` client exercising the echo demo server — kept
/// deliberately independent of the `iolayer` crate, the way a peer
/// talking to the service over the wire would be.
fn main() -> std::io::Result<()> {
    let mut stream = TcpStream::connect("127.0.0.1:17001")?;
    stream.write_all(b"hello")?;

    let mut buf = [0u8; 5];
    stream.read_exact(&mut buf)?;
    assert_eq!(&buf, b"hello");
    println!("echo client: received {:?}", std::str::from_utf8(&buf).unwrap());
    Ok(())
}
