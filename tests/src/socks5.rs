#[cfg(test)]
mod tests {
    use std::{io, net::SocketAddr};

    use async_trait::async_trait;
    use socket::{
        addr::Address,
        server::Server,
        socks5::{Dial, Socks5Connect},
    };
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream},
    };
    use tokio_util::sync::CancellationToken;

    async fn spawn_socks_server<D>(dial: D) -> SocketAddr
    where
        D: Dial + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = listener.local_addr().unwrap();
        let server = Server::new(CancellationToken::new());
        tokio::spawn(async move {
            let _ = server.serve(listener, Socks5Connect::new(dial)).await;
        });
        proxy_addr
    }

    async fn spawn_echo() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (mut stream, _) = listener.accept().await.unwrap();
                tokio::spawn(async move {
                    let (mut read, mut write) = stream.split();
                    let _ = tokio::io::copy(&mut read, &mut write).await;
                });
            }
        });
        echo_addr
    }

    async fn negotiate(stream: &mut TcpStream, methods: &[u8]) {
        stream
            .write_all(&[5, u8::try_from(methods.len()).unwrap()])
            .await
            .unwrap();
        stream.write_all(methods).await.unwrap();
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await.unwrap();
        // No-auth is selected no matter what was offered.
        assert_eq!(buf, [5, 0]);
    }

    fn connect_request(addr: SocketAddr) -> Vec<u8> {
        let octets = match addr {
            SocketAddr::V4(addr) => addr.ip().octets(),
            SocketAddr::V6(_) => unreachable!("test targets are IPv4"),
        };
        let mut request = vec![5, 1, 0, 1];
        request.extend_from_slice(&octets);
        request.extend_from_slice(&addr.port().to_be_bytes());
        request
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn connect_relays_both_directions() {
        let proxy_addr = spawn_socks_server(socket::socks5::DirectDial).await;
        let echo_addr = spawn_echo().await;

        let mut stream = TcpStream::connect(proxy_addr).await.unwrap();
        negotiate(&mut stream, &[0x00, 0x02]).await;

        let request = connect_request(echo_addr);
        stream.write_all(&request).await.unwrap();

        let mut reply = [0u8; 10];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[..3], [5, 0, 0]);
        // The bound-address field echoes the requested address.
        assert_eq!(reply[3..], request[3..]);

        stream.write_all(b"hello world").await.unwrap();
        let mut buf = [0u8; 11];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello world");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn connect_by_domain_name() {
        let proxy_addr = spawn_socks_server(socket::socks5::DirectDial).await;
        let echo_addr = spawn_echo().await;

        let mut stream = TcpStream::connect(proxy_addr).await.unwrap();
        negotiate(&mut stream, &[0x00]).await;

        let name = b"localhost";
        let mut request = vec![5, 1, 0, 3, name.len() as u8];
        request.extend_from_slice(name);
        request.extend_from_slice(&echo_addr.port().to_be_bytes());
        stream.write_all(&request).await.unwrap();

        let mut reply = vec![0u8; 3 + 2 + name.len() + 2];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[..3], [5, 0, 0]);
        assert_eq!(reply[3..], request[3..]);

        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    struct RefusedDial;

    #[async_trait]
    impl Dial for RefusedDial {
        async fn dial(
            &self,
            _cancellation: &CancellationToken,
            _addr: &Address,
        ) -> io::Result<TcpStream> {
            Err(io::Error::from(io::ErrorKind::ConnectionRefused))
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unreachable_target_replies_host_unreachable() {
        let proxy_addr = spawn_socks_server(RefusedDial).await;

        let mut stream = TcpStream::connect(proxy_addr).await.unwrap();
        negotiate(&mut stream, &[0x00]).await;

        let request = connect_request("192.0.2.1:80".parse().unwrap());
        stream.write_all(&request).await.unwrap();

        let mut reply = [0u8; 10];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[..3], [5, 3, 0]);

        // No relay: the connection is closed after the error reply.
        let mut buf = [0u8; 1];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn bind_command_replies_command_not_supported() {
        let proxy_addr = spawn_socks_server(socket::socks5::DirectDial).await;

        let mut stream = TcpStream::connect(proxy_addr).await.unwrap();
        negotiate(&mut stream, &[0x00]).await;

        // BIND with a nonzero reserved byte: the reply reports 0x07 and
        // echoes the reserved byte as received.
        let mut request = vec![5, 2, 0x2a, 1];
        request.extend_from_slice(&[192, 0, 2, 9]);
        request.extend_from_slice(&80u16.to_be_bytes());
        stream.write_all(&request).await.unwrap();

        let mut reply = [0u8; 10];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[..3], [5, 7, 0x2a]);

        let mut buf = [0u8; 1];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn bad_version_closes_without_reply() {
        let proxy_addr = spawn_socks_server(socket::socks5::DirectDial).await;

        let mut stream = TcpStream::connect(proxy_addr).await.unwrap();
        stream.write_all(&[4, 1, 0]).await.unwrap();

        let mut buf = [0u8; 1];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
    }
}
