// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! Accept loop plus the single-packet UDP discovery responder, both bound
//! to the same port.

use crate::network::connection::ClientSocket;
use crate::server::Server;
use eyre::WrapErr;
use std::sync::Arc;
use tokio::net::{TcpListener, UdpSocket};
use tracing::{error, info};

pub async fn serve(server: Arc<Server>, port: u16) -> Result<(), eyre::Error> {
    let tcp = TcpListener::bind(("::", port))
        .await
        .wrap_err_with(|| format!("cannot listen on TCP port {port}"))?;
    let udp = UdpSocket::bind(("::", port))
        .await
        .wrap_err_with(|| format!("cannot listen on UDP port {port}"))?;

    info!("server is ready to listen on {port}");

    let accept_server = server.clone();
    tokio::spawn(async move {
        let stop = accept_server.stop_token();
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                accepted = tcp.accept() => match accepted {
                    Ok((stream, _)) => {
                        let client = ClientSocket::new(stream);
                        accept_server
                            .user_manager()
                            .process_new_connection(&accept_server, client.clone());
                        client.start();
                    }
                    Err(e) => error!("Accept error: {e}"),
                },
            }
        }
    });

    tokio::spawn(async move {
        let stop = server.stop_token();
        let mut buf = [0u8; 1024];
        loop {
            let (len, peer) = tokio::select! {
                _ = stop.cancelled() => break,
                received = udp.recv_from(&mut buf) => match received {
                    Ok(r) => r,
                    Err(e) => {
                        error!("UDP receive error: {e}");
                        continue;
                    }
                },
            };

            let text = String::from_utf8_lossy(&buf[..len]);
            if text == "fkDetectServer" {
                let _ = udp.send_to(b"me", peer).await;
            } else if let Some(client_version) = text.strip_prefix("fkGetDetail,") {
                let config = server.config();
                let detail = serde_json::json!([
                    "0.5.14+",
                    config.icon_url,
                    config.description,
                    config.capacity,
                    server.user_manager().online_count(),
                    client_version,
                ]);
                let _ = udp.send_to(detail.to_string().as_bytes(), peer).await;
            }
        }
    });

    Ok(())
}
