use tracing::{debug, warn};

use super::BlockCollector;
use crate::{
    errors::IndexerError,
    rpc::{CallGuard, ChainClient, LogEntry, LogFilter},
    store::{Asset, DiscoveredBlock, TransferRef},
    types::{Address, Hash32, Word},
};

/// `keccak256("Transfer(address,address,uint256)")`, shared by ERC-20 and ERC-721.
pub const TRANSFER_EVENT_TOPIC: Hash32 = Hash32([
    0xdd, 0xf2, 0x52, 0xad, 0x1b, 0xe2, 0xc8, 0x9b, 0x69, 0xc2, 0xb0, 0x68, 0xfc, 0x37, 0x8d, 0xaa,
    0x95, 0x2b, 0xa7, 0xf1, 0x63, 0xc4, 0xa1, 0x16, 0x28, 0xf5, 0x5a, 0x4d, 0xf5, 0x23, 0xb3, 0xef,
]);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogDirection {
    /// Transfers from and to the accounts.
    Both,
    /// Transfers to the accounts only.
    Incoming,
}

/// A decoded `Transfer` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenTransfer {
    pub asset: Asset,
    pub from: Address,
    pub to: Address,
    pub amount: Word,
}

/// Decodes a `Transfer` log.
///
/// ERC-20 carries the amount in `data` (three topics); ERC-721 indexes the token
/// id as a fourth topic and has empty data.
///
/// # Errors
///
/// Returns [`IndexerError::Malformed`] for a log that is not a well-formed transfer.
pub fn decode_transfer(log: &LogEntry) -> Result<TokenTransfer, IndexerError> {
    if log.topics.first() != Some(&TRANSFER_EVENT_TOPIC) {
        return Err(IndexerError::Malformed(format!(
            "log {}:{} is not a Transfer event",
            log.transaction_hash, log.log_index
        )));
    }
    let party = |i: usize| {
        log.topics.get(i).and_then(Address::from_topic).ok_or_else(|| {
            IndexerError::Malformed(format!(
                "log {}:{} has an invalid address topic {i}",
                log.transaction_hash, log.log_index
            ))
        })
    };
    let from = party(1)?;
    let to = party(2)?;

    match log.topics.len() {
        3 => {
            let amount = Word::from_be_slice(&log.data).ok_or_else(|| {
                IndexerError::Malformed(format!(
                    "log {}:{} carries {} bytes of amount data",
                    log.transaction_hash,
                    log.log_index,
                    log.data.len()
                ))
            })?;
            Ok(TokenTransfer { asset: Asset::Erc20 { contract: log.address }, from, to, amount })
        }
        4 => {
            let token_id = Word(log.topics[3].0);
            Ok(TokenTransfer {
                asset: Asset::Erc721 { contract: log.address, token_id },
                from,
                to,
                amount: Word::from_u128(1),
            })
        }
        n => Err(IndexerError::Malformed(format!(
            "log {}:{} has {n} topics",
            log.transaction_hash, log.log_index
        ))),
    }
}

/// Finds token transfers touching a set of accounts via `eth_getLogs`.
///
/// The range is walked in windows of `batch_size` blocks. A window the node
/// refuses as too large is halved until it fits; a single block that still
/// does not fit is reported as an error.
pub struct LogScanner<'a> {
    client: &'a dyn ChainClient,
    guard: &'a CallGuard,
    batch_size: u64,
}

impl<'a> LogScanner<'a> {
    #[must_use]
    pub fn new(client: &'a dyn ChainClient, guard: &'a CallGuard, batch_size: u64) -> Self {
        Self { client, guard, batch_size: batch_size.max(1) }
    }

    /// Discovered blocks, one per (account, block), in log order.
    pub async fn scan(
        &self,
        accounts: &[Address],
        from: u64,
        to: u64,
        direction: LogDirection,
    ) -> Result<Vec<DiscoveredBlock>, IndexerError> {
        let mut collector = BlockCollector::new(self.client.chain_id());
        if accounts.is_empty() || from > to {
            return Ok(Vec::new());
        }

        let topics: Vec<Hash32> = accounts.iter().map(Address::to_topic).collect();
        let incoming = LogFilter {
            from_block: from,
            to_block: to,
            addresses: Vec::new(),
            topics: vec![Some(vec![TRANSFER_EVENT_TOPIC]), None, Some(topics.clone())],
        };
        let mut filters = vec![incoming.clone()];
        if direction == LogDirection::Both {
            filters.push(LogFilter {
                topics: vec![Some(vec![TRANSFER_EVENT_TOPIC]), Some(topics), None],
                ..incoming
            });
        }

        let mut window_from = from;
        loop {
            let window_to = window_from.saturating_add(self.batch_size - 1).min(to);
            for template in &filters {
                let filter =
                    LogFilter { from_block: window_from, to_block: window_to, ..template.clone() };
                for log in self.fetch_split(filter).await? {
                    collect_log(&mut collector, accounts, &log, direction)?;
                }
            }
            if window_to == to {
                break;
            }
            window_from = window_to + 1;
        }

        debug!(
            chain_id = self.client.chain_id(),
            accounts = accounts.len(),
            from,
            to,
            blocks = collector.len(),
            "transfer logs scanned"
        );
        Ok(collector.into_blocks())
    }

    async fn fetch_split(&self, filter: LogFilter) -> Result<Vec<LogEntry>, IndexerError> {
        let mut pending = vec![filter];
        let mut logs = Vec::new();

        while let Some(filter) = pending.pop() {
            match self.guard.call(self.client.filter_logs(&filter)).await {
                Ok(batch) => logs.extend(batch),
                Err(IndexerError::Rpc(e))
                    if e.is_result_too_large() && filter.from_block < filter.to_block =>
                {
                    let mid = filter.from_block + (filter.to_block - filter.from_block) / 2;
                    warn!(
                        from = filter.from_block,
                        to = filter.to_block,
                        error = %e,
                        "log query too large, splitting"
                    );
                    // upper half pushed first so the lower half is fetched first
                    pending.push(LogFilter { from_block: mid + 1, ..filter.clone() });
                    pending.push(LogFilter { to_block: mid, ..filter });
                }
                Err(e) => return Err(e),
            }
        }

        Ok(logs)
    }
}

fn collect_log(
    collector: &mut BlockCollector,
    accounts: &[Address],
    log: &LogEntry,
    direction: LogDirection,
) -> Result<(), IndexerError> {
    if log.removed {
        return Ok(());
    }
    let transfer = decode_transfer(log)?;
    for account in accounts {
        let outgoing = direction == LogDirection::Both && transfer.from == *account;
        if transfer.to == *account || outgoing {
            collector.add(
                *account,
                log.block_number,
                log.block_hash,
                TransferRef::TokenLog {
                    tx_hash: log.transaction_hash,
                    log_index: log.log_index,
                    asset: transfer.asset,
                    from: transfer.from,
                    to: transfer.to,
                    amount: transfer.amount,
                },
            );
        }
    }
    Ok(())
}
