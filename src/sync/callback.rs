//! Loopback listener receiving the OAuth redirect.

use crate::error::{Result, SyncError};
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// How long to wait for the user to finish the consent screen
pub const CALLBACK_TIMEOUT: Duration = Duration::from_secs(300);

const POLL_INTERVAL: Duration = Duration::from_millis(200);

const SUCCESS_PAGE: &str = "<!DOCTYPE html><html><head><meta charset=\"utf-8\">\
<title>mcdrive-sync</title></head><body style=\"font-family:sans-serif\">\
<h2>Authorization complete</h2><p>You can close this window and return to mcdrive-sync.</p>\
</body></html>";

const DENIED_PAGE: &str = "<!DOCTYPE html><html><head><meta charset=\"utf-8\">\
<title>mcdrive-sync</title></head><body style=\"font-family:sans-serif\">\
<h2>Authorization was not granted</h2><p>You can close this window.</p></body></html>";

/// Code and state carried by the redirect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthCode {
    pub code: String,
    pub state: String,
}

/// What a request to the loopback listener turned out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackRequest {
    Code(AuthCode),
    /// User denied consent (or Google reported another error)
    Denied(String),
    /// Unrelated request such as `/favicon.ico`
    Other,
}

/// Parse the request line of an HTTP request: `GET /?code=..&state=.. HTTP/1.1`.
pub fn parse_callback_request(request: &str) -> Result<CallbackRequest> {
    let first_line = request
        .lines()
        .next()
        .ok_or_else(|| SyncError::Auth("Empty callback request".to_string()))?;

    let target = first_line
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| SyncError::Auth("Invalid callback request".to_string()))?;

    let Some((_, query)) = target.split_once('?') else {
        return Ok(CallbackRequest::Other);
    };

    let mut code = None;
    let mut state = None;
    for pair in query.split('&') {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let value = urlencoding::decode(value)
            .map(|v| v.into_owned())
            .unwrap_or_else(|_| value.to_string());
        match key {
            "code" => code = Some(value),
            "state" => state = Some(value),
            "error" => return Ok(CallbackRequest::Denied(value)),
            _ => {}
        }
    }

    match (code, state) {
        (Some(code), Some(state)) => Ok(CallbackRequest::Code(AuthCode { code, state })),
        (Some(_), None) => Err(SyncError::Auth("Callback is missing state".to_string())),
        _ => Ok(CallbackRequest::Other),
    }
}

/// Listener bound to `127.0.0.1` on an ephemeral port.
pub struct CallbackListener {
    listener: TcpListener,
    port: u16,
}

impl CallbackListener {
    pub fn bind() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .map_err(|e| SyncError::Auth(format!("Cannot bind callback listener: {}", e)))?;
        let port = listener
            .local_addr()
            .map_err(|e| SyncError::Auth(format!("Cannot read callback port: {}", e)))?
            .port();
        info!("OAuth callback listener bound on port {}", port);
        Ok(Self { listener, port })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn redirect_uri(&self) -> String {
        format!("http://127.0.0.1:{}/", self.port)
    }

    /// Serve requests until the redirect arrives or `timeout` elapses.
    pub fn wait(self, timeout: Duration) -> Result<AuthCode> {
        self.listener
            .set_nonblocking(true)
            .map_err(|e| SyncError::Auth(format!("Cannot configure listener: {}", e)))?;
        let deadline = Instant::now() + timeout;

        loop {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    if let Some(code) = handle_connection(stream)? {
                        return Ok(code);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(SyncError::Auth(
                            "Timed out waiting for the browser consent".to_string(),
                        ));
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(e) => {
                    return Err(SyncError::Auth(format!("Callback listener failed: {}", e)));
                }
            }
        }
    }
}

fn handle_connection(mut stream: TcpStream) -> Result<Option<AuthCode>> {
    let io_err = |e: std::io::Error| SyncError::Auth(format!("Callback connection failed: {}", e));

    stream.set_nonblocking(false).map_err(io_err)?;
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .map_err(io_err)?;

    let mut request_line = String::new();
    BufReader::new(&stream)
        .read_line(&mut request_line)
        .map_err(io_err)?;

    match parse_callback_request(&request_line)? {
        CallbackRequest::Code(code) => {
            respond(&mut stream, "200 OK", SUCCESS_PAGE);
            Ok(Some(code))
        }
        CallbackRequest::Denied(reason) => {
            respond(&mut stream, "200 OK", DENIED_PAGE);
            Err(SyncError::Auth(format!("Consent was denied: {}", reason)))
        }
        CallbackRequest::Other => {
            debug!("Ignoring request on callback listener: {}", request_line.trim());
            respond(&mut stream, "404 Not Found", "");
            Ok(None)
        }
    }
}

fn respond(stream: &mut TcpStream, status: &str, body: &str) {
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    );
    let _ = stream.write_all(response.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_code_and_state() {
        let request = "GET /?state=xyz789&code=4%2F0Adeu5&scope=https://www.googleapis.com/auth/drive HTTP/1.1\r\nHost: 127.0.0.1\r\n";
        assert_eq!(
            parse_callback_request(request).unwrap(),
            CallbackRequest::Code(AuthCode {
                code: "4/0Adeu5".to_string(),
                state: "xyz789".to_string(),
            })
        );
    }

    #[test]
    fn test_parse_denied() {
        let request = "GET /?error=access_denied&state=abc HTTP/1.1\r\n";
        assert_eq!(
            parse_callback_request(request).unwrap(),
            CallbackRequest::Denied("access_denied".to_string())
        );
    }

    #[test]
    fn test_parse_unrelated_request() {
        assert_eq!(
            parse_callback_request("GET /favicon.ico HTTP/1.1\r\n").unwrap(),
            CallbackRequest::Other
        );
        assert!(parse_callback_request("").is_err());
        assert!(parse_callback_request("GET /?code=abc HTTP/1.1").is_err());
    }

    #[test]
    fn test_listener_receives_redirect() -> anyhow::Result<()> {
        let listener = CallbackListener::bind()?;
        let port = listener.port();
        assert!(listener.redirect_uri().ends_with(&format!(":{}/", port)));

        let client = std::thread::spawn(move || -> std::io::Result<String> {
            let mut stream = TcpStream::connect(("127.0.0.1", port))?;
            stream.write_all(b"GET /favicon.ico HTTP/1.1\r\n\r\n")?;
            drop(stream);

            let mut stream = TcpStream::connect(("127.0.0.1", port))?;
            stream.write_all(b"GET /?code=abc&state=s1 HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n")?;
            let mut response = String::new();
            std::io::Read::read_to_string(&mut stream, &mut response)?;
            Ok(response)
        });

        let code = listener.wait(Duration::from_secs(10))?;
        assert_eq!(code.code, "abc");
        assert_eq!(code.state, "s1");

        let response = client.join().expect("client thread panicked")?;
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        Ok(())
    }

    #[test]
    fn test_listener_times_out() -> anyhow::Result<()> {
        let listener = CallbackListener::bind()?;
        let result = listener.wait(Duration::from_millis(300));
        assert!(matches!(result, Err(SyncError::Auth(_))));
        Ok(())
    }
}
