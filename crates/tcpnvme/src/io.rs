//! NVM command set handlers (I/O queue)

use bytes::Bytes;

use crate::command::{CommandOutcome, CommandResult, NvmeCommand};
use crate::error::NvmeStatus;
use crate::namespace::Namespace;

/// Broadcast namespace id accepted by Flush
const NSID_ALL: u32 = 0xFFFF_FFFF;

fn check_nsid(ns: &Namespace, nsid: u32) -> Result<(), NvmeStatus> {
    if nsid == ns.nsid() {
        Ok(())
    } else {
        Err(NvmeStatus::InvalidNamespaceOrFormat)
    }
}

/// Flush
pub async fn flush(ns: &Namespace, cmd: &NvmeCommand) -> CommandResult {
    if cmd.nsid != NSID_ALL {
        check_nsid(ns, cmd.nsid)?;
    }
    ns.flush().await?;
    Ok(CommandOutcome::empty())
}

/// Read; the blocks go back to the host as C2HData
pub async fn read(ns: &Namespace, cmd: &NvmeCommand) -> CommandResult {
    check_nsid(ns, cmd.nsid)?;
    let data = ns.read(cmd.slba(), cmd.block_count()).await?;
    Ok(CommandOutcome::with_data(data))
}

/// Write the in-capsule data
pub async fn write(ns: &Namespace, cmd: &NvmeCommand, data: Option<Bytes>) -> CommandResult {
    check_nsid(ns, cmd.nsid)?;
    ns.write(cmd.slba(), cmd.block_count(), data.unwrap_or_default()).await?;
    Ok(CommandOutcome::empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::IoOpcode;
    use crate::config::NamespaceConfig;
    use crate::namespace::MemoryStore;
    use std::sync::Arc;

    fn namespace() -> Namespace {
        let config = NamespaceConfig {
            size_bytes: 64 * 4096,
            ..NamespaceConfig::default()
        };
        Namespace::new(&config, Arc::new(MemoryStore::new(4096)))
    }

    fn rw(opcode: IoOpcode, slba: u64, nlb: u16) -> NvmeCommand {
        let mut cmd = NvmeCommand::new(opcode as u8, 9);
        cmd.nsid = 1;
        cmd.set_slba(slba);
        cmd.set_nlb(nlb);
        cmd
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let ns = namespace();
        let payload = Bytes::from(vec![0x5A; 8192]);
        write(&ns, &rw(IoOpcode::Write, 10, 1), Some(payload.clone()))
            .await
            .unwrap();

        let out = read(&ns, &rw(IoOpcode::Read, 10, 1)).await.unwrap();
        assert_eq!(out.data, Some(payload));
        assert_eq!(out.dw0, 0);
    }

    #[tokio::test]
    async fn test_read_wrong_namespace() {
        let ns = namespace();
        let mut cmd = rw(IoOpcode::Read, 0, 0);
        cmd.nsid = 2;
        assert_eq!(
            read(&ns, &cmd).await,
            Err(NvmeStatus::InvalidNamespaceOrFormat)
        );
    }

    #[tokio::test]
    async fn test_read_past_end() {
        let ns = namespace();
        assert_eq!(
            read(&ns, &rw(IoOpcode::Read, 63, 1)).await,
            Err(NvmeStatus::LbaOutOfRange)
        );
        assert!(read(&ns, &rw(IoOpcode::Read, 63, 0)).await.is_ok());
    }

    #[tokio::test]
    async fn test_transfer_larger_than_mdts() {
        let ns = namespace();
        let payload = Bytes::from(vec![0xC3; 3 * 4096]);
        write(&ns, &rw(IoOpcode::Write, 20, 2), Some(payload.clone()))
            .await
            .unwrap();

        let out = read(&ns, &rw(IoOpcode::Read, 20, 2)).await.unwrap();
        assert_eq!(out.data, Some(payload));

        let out = read(&ns, &rw(IoOpcode::Read, 0, 63)).await.unwrap();
        assert_eq!(out.data.map(|d| d.len()), Some(64 * 4096));
    }

    #[tokio::test]
    async fn test_write_without_data() {
        let ns = namespace();
        assert_eq!(
            write(&ns, &rw(IoOpcode::Write, 0, 0), None).await,
            Err(NvmeStatus::DataSglLengthInvalid)
        );
    }

    #[tokio::test]
    async fn test_flush() {
        let ns = namespace();
        let mut cmd = NvmeCommand::new(IoOpcode::Flush as u8, 1);
        cmd.nsid = 1;
        assert_eq!(flush(&ns, &cmd).await, Ok(CommandOutcome::empty()));

        cmd.nsid = NSID_ALL;
        assert!(flush(&ns, &cmd).await.is_ok());

        cmd.nsid = 7;
        assert_eq!(
            flush(&ns, &cmd).await,
            Err(NvmeStatus::InvalidNamespaceOrFormat)
        );
        assert_eq!(ns.stats().flush_commands, 2);
    }
}
