//! Target over a real TCP socket

mod common;

use std::sync::Arc;

use common::{field_str, Host};
use tcpnvme::{
    AdminOpcode, NvmeCommand, NvmeTcpTarget, TargetConfig, DISCOVERY_NQN, TARGET_NQN,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

#[tokio::test]
async fn discover_over_tcp() {
    let target = Arc::new(NvmeTcpTarget::new(TargetConfig::default()).unwrap());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server = {
        let target = Arc::clone(&target);
        tokio::spawn(async move {
            target
                .serve_with_shutdown(listener, async {
                    let _ = stop_rx.await;
                })
                .await
        })
    };

    let mut host = Host::new(TcpStream::connect(addr).await.unwrap());
    host.handshake().await;
    assert!(host.connect(DISCOVERY_NQN, 0, 32).await.is_success());
    assert!(host.enable().await.is_success());

    let mut cmd = NvmeCommand::new(AdminOpcode::GetLogPage as u8, 9);
    cmd.cdw10 = ((2048 / 4 - 1) << 16) | 0x70;
    let (page, cqe) = host.command_with_data(cmd).await;
    assert!(cqe.is_success());
    assert_eq!(page.len(), 2048);
    assert_eq!(field_str(&page[1024 + 256..1024 + 512]), TARGET_NQN);

    // A second connection is independent of the first
    let mut other = Host::new(TcpStream::connect(addr).await.unwrap());
    other.handshake().await;
    assert!(other.connect(TARGET_NQN, 0, 32).await.is_success());
    let csts = other
        .command(NvmeCommand::property_get(5, 0x1C, false))
        .await;
    assert_eq!(csts.dw0 & 1, 0);

    stop_tx.send(()).unwrap();
    server.await.unwrap().unwrap();
}
