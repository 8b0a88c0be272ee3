use std::io::{ErrorKind, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};

use super::constants::*;
use super::error::SendError;
use super::event::EventView;

/// Wrap an event in the outbound send frame, reusing `frame`'s allocation.
///
/// ```text
/// [total words, protocol tag, board count, exp/run, reserved, node id]
/// [event payload]
/// [reserved, terminator magic]
/// ```
pub fn encode_send_frame(frame: &mut Vec<u8>, event: &[u8], node_id: u32) {
    let exp_run = EventView::new(event).exp_run().unwrap_or(0);
    let event_words = event.len() / 4;
    let total_words = SEND_HEADER_WORDS + event_words + SEND_TRAILER_WORDS;

    frame.clear();
    frame.resize(total_words * 4, 0);
    let header: [u32; SEND_HEADER_WORDS] = [
        total_words as u32,
        SEND_PROTOCOL_TAG,
        1,
        exp_run,
        0,
        node_id,
    ];
    LittleEndian::write_u32_into(&header, &mut frame[..SEND_HEADER_WORDS * 4]);

    let payload_end = (SEND_HEADER_WORDS + event_words) * 4;
    frame[SEND_HEADER_WORDS * 4..payload_end].copy_from_slice(&event[..event_words * 4]);

    let trailer: [u32; SEND_TRAILER_WORDS] = [0, SEND_TRAILER_MAGIC];
    LittleEndian::write_u32_into(&trailer, &mut frame[payload_end..]);
}

/// Write a whole frame, retrying on interrupted and would-block conditions.
///
/// A zero-length write (peer gone), any other IO error, or a write that reports
/// more bytes than the frame holds is an error.
pub fn write_frame<W: Write>(link: &mut W, frame: &[u8]) -> Result<(), SendError> {
    let total = frame.len();
    let mut sent = 0;
    while sent < total {
        match link.write(&frame[sent..]) {
            Ok(0) => return Err(SendError::Disconnected { sent, total }),
            Ok(n) => {
                sent += n;
                if sent > total {
                    return Err(SendError::Oversend { sent, total });
                }
            }
            Err(e) if matches!(e.kind(), ErrorKind::Interrupted | ErrorKind::WouldBlock) => {
                continue
            }
            Err(e) => return Err(SendError::IOError(e)),
        }
    }
    Ok(())
}

/// Open the persistent downstream connection for one worker.
///
/// Retries the connection up to `retries` extra times, one second apart, since
/// the aggregator may come up after the relay.
pub fn connect_downstream(
    addr: &str,
    send_timeout: Duration,
    retries: u32,
) -> Result<TcpStream, SendError> {
    let mut attempt = 0;
    loop {
        match try_connect(addr, send_timeout) {
            Ok(stream) => {
                spdlog::info!("Connected to downstream {}", addr);
                return Ok(stream);
            }
            Err(e) if attempt < retries => {
                spdlog::warn!(
                    "Connection to {} failed ({}); retrying ({}/{})",
                    addr,
                    e,
                    attempt + 1,
                    retries
                );
                attempt += 1;
                std::thread::sleep(Duration::from_secs(1));
            }
            Err(e) => {
                return Err(SendError::Connect {
                    addr: addr.to_string(),
                    source: e,
                })
            }
        }
    }
}

fn try_connect(addr: &str, send_timeout: Duration) -> std::io::Result<TcpStream> {
    let mut last_error = None;
    for sock_addr in addr.to_socket_addrs()? {
        match TcpStream::connect_timeout(&sock_addr, send_timeout) {
            Ok(stream) => {
                stream.set_write_timeout(Some(send_timeout))?;
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(e) => last_error = Some(e),
        }
    }
    Err(last_error.unwrap_or_else(|| {
        std::io::Error::new(ErrorKind::AddrNotAvailable, "address resolved to nothing")
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::SyntheticEvent;
    use std::io::Read;
    use std::net::TcpListener;

    /// Accepts at most `chunk` bytes per call and fails every other call
    struct Flaky {
        out: Vec<u8>,
        chunk: usize,
        calls: usize,
        fail_with: ErrorKind,
    }

    impl Write for Flaky {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.calls += 1;
            if self.calls % 2 == 1 {
                return Err(std::io::Error::from(self.fail_with));
            }
            let n = buf.len().min(self.chunk);
            self.out.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct Liar;

    impl Write for Liar {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            Ok(buf.len() + 1)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_frame_layout() {
        let event = SyntheticEvent::new(3, 0x0040_0300)
            .with_channel(0, vec![1, 2])
            .build();
        let mut frame = Vec::new();
        encode_send_frame(&mut frame, &event, 0x0301_0002);

        let words = frame.len() / 4;
        assert_eq!(words, SEND_HEADER_WORDS + event.len() / 4 + SEND_TRAILER_WORDS);
        assert_eq!(LittleEndian::read_u32(&frame[0..]), words as u32);
        assert_eq!(LittleEndian::read_u32(&frame[4..]), SEND_PROTOCOL_TAG);
        assert_eq!(LittleEndian::read_u32(&frame[8..]), 1);
        assert_eq!(LittleEndian::read_u32(&frame[12..]), 0x0040_0300);
        assert_eq!(LittleEndian::read_u32(&frame[20..]), 0x0301_0002);
        assert_eq!(&frame[24..24 + event.len()], &event[..]);
        assert_eq!(
            LittleEndian::read_u32(&frame[frame.len() - 4..]),
            SEND_TRAILER_MAGIC
        );
    }

    #[test]
    fn test_retry_on_transient_errors() {
        for kind in [ErrorKind::Interrupted, ErrorKind::WouldBlock] {
            let mut link = Flaky {
                out: Vec::new(),
                chunk: 7,
                calls: 0,
                fail_with: kind,
            };
            let frame: Vec<u8> = (0..100).collect();
            write_frame(&mut link, &frame).unwrap();
            assert_eq!(link.out, frame);
        }
    }

    #[test]
    fn test_other_errors_are_fatal() {
        let mut link = Flaky {
            out: Vec::new(),
            chunk: 7,
            calls: 0,
            fail_with: ErrorKind::BrokenPipe,
        };
        assert!(matches!(
            write_frame(&mut link, &[0; 16]),
            Err(SendError::IOError(_))
        ));
    }

    #[test]
    fn test_disconnect_and_oversend() {
        let mut closed: &mut [u8] = &mut [0u8; 4];
        assert!(matches!(
            write_frame(&mut closed, &[1; 8]),
            Err(SendError::Disconnected { sent: 4, total: 8 })
        ));
        assert!(matches!(
            write_frame(&mut Liar, &[1; 8]),
            Err(SendError::Oversend { sent: 9, total: 8 })
        ));
    }

    #[test]
    fn test_tcp_delivery() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let reader = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut received = Vec::new();
            stream.read_to_end(&mut received).unwrap();
            received
        });

        let mut stream = connect_downstream(&addr, Duration::from_secs(2), 0).unwrap();
        let frame: Vec<u8> = (0..=255).collect();
        write_frame(&mut stream, &frame).unwrap();
        drop(stream);
        assert_eq!(reader.join().unwrap(), frame);
    }

    #[test]
    fn test_connect_failure() {
        // Grab a free port, then close it
        let addr = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .to_string();
        assert!(matches!(
            connect_downstream(&addr, Duration::from_millis(200), 0),
            Err(SendError::Connect { .. })
        ));
    }
}
