//! Small helpers shared by the hub, the proxy and the single-user server

use crate::backoff::{exponential_backoff, Backoff};
use crate::error::HubResult;
use std::io::ErrorKind;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{error, warn};

/// Join url path segments with exactly one `/` between them.
///
/// A leading `/` on the first piece and a trailing `/` on the last piece are
/// preserved; empty pieces are skipped.
pub fn url_path_join(pieces: &[&str]) -> String {
    let initial = pieces.first().is_some_and(|p| p.starts_with('/'));
    let trailing = pieces.last().is_some_and(|p| p.ends_with('/'));

    let mut result = pieces
        .iter()
        .map(|p| p.trim_matches('/'))
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("/");

    if initial {
        result.insert(0, '/');
    }
    if trailing {
        result.push('/');
    }
    if result == "//" {
        result = "/".to_string();
    }
    result
}

/// Ask the OS for a currently unused TCP port on localhost
pub fn random_port() -> std::io::Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

/// Map wildcard listen addresses to something a client can connect to
pub fn connectable_ip(ip: &str) -> &str {
    match ip {
        "" | "0.0.0.0" => "127.0.0.1",
        "::" => "::1",
        other => other,
    }
}

/// Check whether a TCP connection to `ip:port` can be opened
pub async fn can_connect(ip: &str, port: u16) -> bool {
    let ip = connectable_ip(ip);
    let connect = TcpStream::connect((ip, port));

    match tokio::time::timeout(Duration::from_secs(1), connect).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            if !matches!(
                e.kind(),
                ErrorKind::ConnectionRefused | ErrorKind::TimedOut | ErrorKind::ConnectionReset
            ) {
                error!(ip, port, error = %e, "Unexpected error connecting");
            }
            false
        }
        Err(_) => false,
    }
}

/// Wait for a server to accept TCP connections on `ip:port`
pub async fn wait_for_server(ip: &str, port: u16, backoff: &Backoff) -> HubResult<()> {
    let message = format!(
        "Server at {}:{} didn't respond in {} seconds",
        connectable_ip(ip),
        port,
        backoff.timeout.as_secs_f64()
    );
    exponential_backoff(backoff, &message, move || async move {
        can_connect(ip, port).await.then_some(())
    })
    .await
}

/// Wait for an HTTP server to answer `url` with anything but a 5xx
///
/// A 404 still means the server is up, which is all this checks.
pub async fn wait_for_http_server(
    client: &reqwest::Client,
    url: &str,
    backoff: &Backoff,
) -> HubResult<()> {
    let message = format!(
        "Server at {} didn't respond in {} seconds",
        url,
        backoff.timeout.as_secs_f64()
    );
    exponential_backoff(backoff, &message, move || async move {
        match client.get(url).send().await {
            Ok(response) if response.status().is_server_error() => {
                warn!(url, status = %response.status(), "Server responded with an error");
                None
            }
            Ok(_) => Some(()),
            Err(e) if e.is_connect() || e.is_timeout() => None,
            Err(e) => {
                warn!(url, error = %e, "Error reaching server");
                None
            }
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn quick(timeout_ms: u64) -> Backoff {
        Backoff {
            start_wait: Duration::from_millis(10),
            max_wait: Duration::from_millis(50),
            timeout: Duration::from_millis(timeout_ms),
            ..Backoff::default()
        }
    }

    #[test]
    fn test_url_path_join() {
        assert_eq!(url_path_join(&["/hub/", "api"]), "/hub/api");
        assert_eq!(url_path_join(&["/hub/", "/login/"]), "/hub/login/");
        assert_eq!(url_path_join(&["/user", "river"]), "/user/river");
        assert_eq!(url_path_join(&["/", "/"]), "/");
        assert_eq!(url_path_join(&["/", ""]), "/");
        assert_eq!(url_path_join(&["hub", "api/"]), "hub/api/");
        assert_eq!(url_path_join(&["/a//", "", "//b"]), "/a/b");
    }

    #[test]
    fn test_connectable_ip() {
        assert_eq!(connectable_ip(""), "127.0.0.1");
        assert_eq!(connectable_ip("0.0.0.0"), "127.0.0.1");
        assert_eq!(connectable_ip("10.0.0.5"), "10.0.0.5");
    }

    #[test]
    fn test_random_port() {
        let port = random_port().unwrap();
        assert!(port > 0);
    }

    #[tokio::test]
    async fn test_can_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(can_connect("127.0.0.1", port).await);
        assert!(can_connect("", port).await);

        drop(listener);
        assert!(!can_connect("127.0.0.1", port).await);
    }

    #[tokio::test]
    async fn test_wait_for_server_late_listener() {
        let port = random_port().unwrap();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
            loop {
                let _ = listener.accept().await;
            }
        });

        wait_for_server("127.0.0.1", port, &quick(3000)).await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_server_times_out() {
        let port = random_port().unwrap();
        let err = wait_for_server("127.0.0.1", port, &quick(200)).await.unwrap_err();
        assert!(err.to_string().contains("didn't respond"));
    }

    async fn serve_status(status_line: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                let response = format!("HTTP/1.1 {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n", status_line);
                let _ = stream.write_all(response.as_bytes()).await;
            }
        });
        port
    }

    #[tokio::test]
    async fn test_wait_for_http_server_accepts_404() {
        let port = serve_status("404 Not Found").await;
        let client = reqwest::Client::new();
        let url = format!("http://127.0.0.1:{}/missing", port);
        wait_for_http_server(&client, &url, &quick(2000)).await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_http_server_rejects_5xx() {
        let port = serve_status("503 Service Unavailable").await;
        let client = reqwest::Client::new();
        let url = format!("http://127.0.0.1:{}/", port);
        assert!(wait_for_http_server(&client, &url, &quick(300)).await.is_err());
    }
}
