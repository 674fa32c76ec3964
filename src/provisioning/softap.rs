//! SoftAP captive-portal credential transport.
//!
//! The device opens an access point with a fixed gateway address, then
//! serves a minimal configuration page over HTTP while hijacking all DNS so
//! that any browser lands on it. A single cooperative loop multiplexes the
//! TCP listener (port 80) and the UDP DNS socket (port 53); both are
//! non-blocking and polled together.
//!
//! Unlike the BLE transport there is no button confirmation: submitting the
//! form is the confirming action. Before the (slow) connect attempt both
//! listeners are closed so the radio never holds AP and station roles with
//! live sockets at once; they are reopened only if the attempt fails.
//!
//! The access point itself is driven by the session owner; this module owns
//! only the portal sockets and HTTP/DNS traffic.

use crate::provisioning::dns;
use log::{debug, info, warn};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Poll interval for the cooperative socket loop.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Per-client read timeout; browsers send the whole request promptly.
const CLIENT_READ_TIMEOUT: Duration = Duration::from_millis(500);

/// Upper bound on an accepted HTTP request.
const MAX_REQUEST_LEN: usize = 16 * 1024;

/// Why the portal loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortalOutcome {
    /// A form submission led to a successful connection.
    Connected,
    /// The stop flag was raised before any submission succeeded.
    Stopped,
}

/// A decoded `POST /configure` body.
///
/// Missing fields decode as empty strings. `setup_code` is accepted and
/// passed through but not verified against anything; it is reserved as an
/// out-of-band pairing secret.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FormSubmission {
    pub ssid: String,
    pub password: String,
    pub setup_code: String,
}

/// Decode a form body: `key=value` pairs joined by `&`, `+` as space.
pub fn parse_form(body: &str) -> FormSubmission {
    let mut submission = FormSubmission::default();
    for param in body.split('&') {
        let (key, value) = param.split_once('=').unwrap_or((param, ""));
        let value = value.replace('+', " ");
        match key {
            "ssid" => submission.ssid = value,
            "password" => submission.password = value,
            "setup_code" => submission.setup_code = value,
            _ => debug!("Ignoring unknown form field '{}'", key),
        }
    }
    submission
}

/// Captive portal serving the configuration page and DNS hijack.
pub struct CaptivePortal {
    gateway: [u8; 4],
    http_addr: SocketAddr,
    dns_addr: SocketAddr,
    http: Option<TcpListener>,
    dns: Option<UdpSocket>,
    stop: Arc<AtomicBool>,
}

impl CaptivePortal {
    /// Bind the portal sockets. Port 0 binds an ephemeral port, which tests
    /// use to avoid privileged ports; the bound addresses are then available
    /// from [`http_addr`](Self::http_addr) and [`dns_addr`](Self::dns_addr).
    pub fn bind(gateway: [u8; 4], http_port: u16, dns_port: u16) -> io::Result<Self> {
        let http = TcpListener::bind(("0.0.0.0", http_port))?;
        http.set_nonblocking(true)?;
        let dns = UdpSocket::bind(("0.0.0.0", dns_port))?;
        dns.set_nonblocking(true)?;

        let http_addr = http.local_addr()?;
        let dns_addr = dns.local_addr()?;
        info!(
            "Captive portal listening on http {} / dns {}",
            http_addr, dns_addr
        );
        Ok(Self {
            gateway,
            http_addr,
            dns_addr,
            http: Some(http),
            dns: Some(dns),
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    pub fn dns_addr(&self) -> SocketAddr {
        self.dns_addr
    }

    /// Flag that makes [`run`](Self::run) exit at the next poll.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Serve the portal until a submission connects or the stop flag rises.
    ///
    /// `connect` receives each decoded form submission and reports whether
    /// the connection test succeeded. It is called with the portal sockets
    /// already closed; on failure they are rebound and the portal keeps
    /// serving.
    pub fn run(
        &mut self,
        mut connect: impl FnMut(FormSubmission) -> bool,
    ) -> io::Result<PortalOutcome> {
        loop {
            if self.stop.load(Ordering::Acquire) {
                info!("Captive portal stopped");
                return Ok(PortalOutcome::Stopped);
            }

            self.serve_dns();

            let accepted = match self.http.as_ref() {
                Some(listener) => match listener.accept() {
                    Ok((stream, peer)) => Some((stream, peer)),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => None,
                    Err(e) => {
                        warn!("Portal accept failed: {}", e);
                        None
                    }
                },
                None => None,
            };

            if let Some((stream, peer)) = accepted {
                debug!("Portal client {}", peer);
                if self.handle_client(stream, &mut connect)? {
                    return Ok(PortalOutcome::Connected);
                }
            }

            thread::sleep(POLL_INTERVAL);
        }
    }

    fn serve_dns(&self) {
        let Some(socket) = self.dns.as_ref() else {
            return;
        };
        let mut datagram = [0u8; 512];
        loop {
            match socket.recv_from(&mut datagram) {
                Ok((len, peer)) => {
                    if let Some(response) = dns::build_response(&datagram[..len], self.gateway) {
                        if let Err(e) = socket.send_to(&response, peer) {
                            warn!("DNS response to {} failed: {}", peer, e);
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    warn!("DNS receive failed: {}", e);
                    return;
                }
            }
        }
    }

    /// Handle one HTTP client. Returns `Ok(true)` when a submission
    /// connected successfully.
    fn handle_client(
        &mut self,
        mut stream: TcpStream,
        connect: &mut impl FnMut(FormSubmission) -> bool,
    ) -> io::Result<bool> {
        let request = match read_request(&mut stream) {
            Ok(request) => request,
            Err(e) => {
                warn!("Failed to read portal request: {}", e);
                return Ok(false);
            }
        };

        if !request.starts_with("POST /configure") {
            serve_page(&mut stream, CONFIG_PAGE);
            return Ok(false);
        }

        let submission = parse_form(request_body(&request));
        info!("Portal submission for SSID '{}'", submission.ssid);

        // Close both listeners before the connect attempt: the radio must
        // not hold AP and station roles with live sockets during the
        // transition. The accepted client stream stays open for the result
        // page.
        self.http = None;
        self.dns = None;

        if connect(submission) {
            serve_page(&mut stream, SUCCESS_PAGE);
            // Give the client time to read the page before teardown.
            thread::sleep(Duration::from_secs(2));
            Ok(true)
        } else {
            self.rebind()?;
            serve_page(&mut stream, ERROR_PAGE);
            Ok(false)
        }
    }

    /// Reopen the portal sockets on their original addresses after a failed
    /// connect attempt.
    fn rebind(&mut self) -> io::Result<()> {
        let http = TcpListener::bind(self.http_addr)?;
        http.set_nonblocking(true)?;
        let dns = UdpSocket::bind(self.dns_addr)?;
        dns.set_nonblocking(true)?;
        self.http = Some(http);
        self.dns = Some(dns);
        info!("Captive portal reopened after failed connect attempt");
        Ok(())
    }
}

/// Read one HTTP request, bounded in size and time.
fn read_request(stream: &mut TcpStream) -> io::Result<String> {
    stream.set_read_timeout(Some(CLIENT_READ_TIMEOUT))?;
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if request_complete(&buffer) || buffer.len() > MAX_REQUEST_LEN {
                    break;
                }
            }
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                break
            }
            Err(e) => return Err(e),
        }
    }
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

fn request_complete(buffer: &[u8]) -> bool {
    let text = String::from_utf8_lossy(buffer);
    let Some(header_end) = text.find("\r\n\r\n") else {
        return false;
    };
    match content_length(&text) {
        Some(length) => buffer.len() >= header_end + 4 + length,
        None => true,
    }
}

fn content_length(request: &str) -> Option<usize> {
    let rest = request.split("Content-Length: ").nth(1)?;
    rest.split("\r\n").next()?.trim().parse().ok()
}

/// The request body, truncated to the declared `Content-Length`.
fn request_body(request: &str) -> &str {
    let Some(header_end) = request.find("\r\n\r\n") else {
        return "";
    };
    let body = &request[header_end + 4..];
    match content_length(request) {
        Some(length) if length <= body.len() => &body[..length],
        _ => body,
    }
}

fn serve_page(stream: &mut TcpStream, html: &str) {
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        html.len(),
        html
    );
    if let Err(e) = stream.write_all(response.as_bytes()) {
        warn!("Failed to serve portal page: {}", e);
    }
}

const CONFIG_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head>
    <title>WiFi Setup</title>
    <meta name="viewport" content="width=device-width, initial-scale=1">
    <style>
        body { font-family: Arial, sans-serif; margin: 20px; }
        .container { max-width: 400px; margin: 0 auto; }
        input { width: 100%; padding: 8px; margin: 10px 0; box-sizing: border-box; }
        button { width: 100%; padding: 10px; background: #007bff; color: white; border: none; border-radius: 10px; }
        h1 { text-align: center; }
    </style>
</head>
<body>
    <div class="container">
        <h1>WiFi Setup</h1>
        <form method="POST" action="/configure">
            <input type="text" name="ssid" placeholder="WiFi Name" required>
            <input type="password" name="password" placeholder="WiFi Password" required>
            <input type="text" name="setup_code" placeholder="Setup Code">
            <button type="submit">Connect</button>
        </form>
    </div>
</body>
</html>
"#;

const SUCCESS_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head>
    <title>WiFi Connected</title>
    <meta name="viewport" content="width=device-width, initial-scale=1">
    <style>
        body { font-family: Arial, sans-serif; margin: 20px; }
        .container { max-width: 400px; margin: 0 auto; text-align: center; }
        .success { color: #28a745; }
    </style>
</head>
<body>
    <div class="container">
        <h1 class="success">Successfully Connected!</h1>
        <p>Your device is now connected to WiFi.</p>
        <p>You can close this page.</p>
    </div>
</body>
</html>
"#;

const ERROR_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head>
    <title>Connection Failed</title>
    <meta name="viewport" content="width=device-width, initial-scale=1">
    <style>
        body { font-family: Arial, sans-serif; margin: 20px; }
        .container { max-width: 400px; margin: 0 auto; text-align: center; }
        .error { color: #dc3545; }
        button { width: 200px; padding: 10px; background: #007bff; color: white; border: none; }
    </style>
</head>
<body>
    <div class="container">
        <h1 class="error">Connection Failed</h1>
        <p>Unable to connect to the WiFi network. Please check your credentials.</p>
        <button onclick="window.history.back()">Try Again</button>
    </div>
</body>
</html>
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_parse_form_full() {
        let submission = parse_form("ssid=My+Network&password=hunter22&setup_code=ABC123");
        assert_eq!(submission.ssid, "My Network");
        assert_eq!(submission.password, "hunter22");
        assert_eq!(submission.setup_code, "ABC123");
    }

    #[test]
    fn test_parse_form_missing_fields_are_empty() {
        let submission = parse_form("ssid=OnlySsid");
        assert_eq!(submission.ssid, "OnlySsid");
        assert_eq!(submission.password, "");
        assert_eq!(submission.setup_code, "");
    }

    #[test]
    fn test_parse_form_value_may_contain_equals() {
        let submission = parse_form("ssid=Net&password=a=b=c");
        assert_eq!(submission.password, "a=b=c");
    }

    #[test]
    fn test_request_body_respects_content_length() {
        let request = "POST /configure HTTP/1.1\r\nContent-Length: 9\r\n\r\nssid=Netztrailing";
        assert_eq!(request_body(request), "ssid=Netz");
    }

    fn local(addr: SocketAddr) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], addr.port()))
    }

    fn http_exchange(addr: SocketAddr, request: &str) -> String {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(request.as_bytes()).unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).unwrap();
        response
    }

    #[test]
    fn test_portal_serves_form_and_hijacks_dns() {
        let portal = CaptivePortal::bind([192, 168, 4, 1], 0, 0).unwrap();
        let http_addr = local(portal.http_addr());
        let dns_addr = local(portal.dns_addr());
        let stop = portal.stop_handle();

        let worker = thread::spawn(move || {
            let mut portal = portal;
            portal.run(|_| false).unwrap()
        });

        let response = http_exchange(http_addr, "GET / HTTP/1.1\r\n\r\n");
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains("POST"));
        assert!(response.contains("/configure"));

        // DNS hijack: any query resolves to the gateway.
        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let mut query = vec![0x12, 0x34, 0x01, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
        query.extend_from_slice(b"\x03foo\x03bar\x00\x00\x01\x00\x01");
        client.send_to(&query, dns_addr).unwrap();
        let mut answer = [0u8; 512];
        let (len, _) = client.recv_from(&mut answer).unwrap();
        assert_eq!(&answer[len - 4..len], &[192, 168, 4, 1]);

        stop.store(true, Ordering::Release);
        assert_eq!(worker.join().unwrap(), PortalOutcome::Stopped);
    }

    #[test]
    fn test_failed_submission_reopens_portal() {
        let portal = CaptivePortal::bind([192, 168, 4, 1], 0, 0).unwrap();
        let http_addr = local(portal.http_addr());
        let stop = portal.stop_handle();

        let submissions = Arc::new(Mutex::new(Vec::new()));
        let submissions_clone = submissions.clone();
        let worker = thread::spawn(move || {
            let mut portal = portal;
            portal
                .run(|submission| {
                    submissions_clone.lock().unwrap().push(submission);
                    false
                })
                .unwrap()
        });

        let body = "ssid=MyWifi&password=secret123&setup_code=XYZ";
        let request = format!(
            "POST /configure HTTP/1.1\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        let response = http_exchange(http_addr, &request);
        assert!(response.contains("Connection Failed"));

        // Portal is listening again after the failed attempt.
        let response = http_exchange(http_addr, "GET / HTTP/1.1\r\n\r\n");
        assert!(response.contains("/configure"));

        stop.store(true, Ordering::Release);
        worker.join().unwrap();

        let recorded = submissions.lock().unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].ssid, "MyWifi");
        assert_eq!(recorded[0].password, "secret123");
        assert_eq!(recorded[0].setup_code, "XYZ");
    }

    #[test]
    fn test_successful_submission_ends_portal() {
        let portal = CaptivePortal::bind([192, 168, 4, 1], 0, 0).unwrap();
        let http_addr = local(portal.http_addr());

        let worker = thread::spawn(move || {
            let mut portal = portal;
            portal.run(|_| true).unwrap()
        });

        let body = "ssid=MyWifi&password=secret123";
        let request = format!(
            "POST /configure HTTP/1.1\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        let response = http_exchange(http_addr, &request);
        assert!(response.contains("Successfully Connected"));
        assert_eq!(worker.join().unwrap(), PortalOutcome::Connected);
    }
}
