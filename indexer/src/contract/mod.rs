//! Contract ABI, event decoding, and view calls.

pub mod units;

use crate::rpc::{EvmRpc, RpcLog};
use alloy_primitives::{Address, Bytes, B256, U256};
use alloy_sol_types::{sol, SolCall, SolEvent};
use eyre::{eyre, Result, WrapErr};
use rust_decimal::Decimal;
use std::fmt;
use tracing::warn;

sol! {
    interface IHelpContract {
        event UserRegistered(address indexed user, address indexed sponsor);
        event DonationReceived(address indexed user, uint256 amount, uint256 level, uint256 newBalance);
        event VoluntaryDonation(address indexed user, uint256 amount, uint256 reservePool);
        event Withdrawal(address indexed user, uint256 amountUsdt, uint256 amountHelp, uint256 remainingBalance);
        event IncentiveGranted(address indexed user, uint256 amount, uint256 unlockTimestamp);
        event IncentiveClaimed(address indexed user, uint256 amount);
        event LevelUp(address indexed user, uint256 newLevel, uint256 remainingBalance);

        function ENTRY_FEE() external view returns (uint256);
        function getHelpPrice() external view returns (uint256);
        function levelAmounts(uint256 level) external view returns (uint256);
        function getUserQueueAndIncentiveInfo(address user) external view returns (bool isInQueue, uint256 queuePosition, uint256 lockedAmount, uint256 unlockTimestamp);
        function usdt() external view returns (address);
        function helpToken() external view returns (address);
    }

    interface IERC20 {
        function balanceOf(address account) external view returns (uint256);
        function allowance(address owner, address spender) external view returns (uint256);
        function decimals() external view returns (uint8);
    }
}

/// Named event filters understood by the scanner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    UserRegistered,
    DonationReceived,
    VoluntaryDonation,
    Withdrawal,
    IncentiveGranted,
    IncentiveClaimed,
    LevelUp,
}

impl EventKind {
    /// Row reconciliation order: one full-range pass per kind, in this order.
    pub const ALL: [EventKind; 7] = [
        EventKind::UserRegistered,
        EventKind::DonationReceived,
        EventKind::VoluntaryDonation,
        EventKind::Withdrawal,
        EventKind::IncentiveGranted,
        EventKind::IncentiveClaimed,
        EventKind::LevelUp,
    ];

    /// Kinds that feed the aggregate counters.
    pub const COUNTED: [EventKind; 4] = [
        EventKind::UserRegistered,
        EventKind::DonationReceived,
        EventKind::VoluntaryDonation,
        EventKind::IncentiveGranted,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::UserRegistered => "UserRegistered",
            Self::DonationReceived => "DonationReceived",
            Self::VoluntaryDonation => "VoluntaryDonation",
            Self::Withdrawal => "Withdrawal",
            Self::IncentiveGranted => "IncentiveGranted",
            Self::IncentiveClaimed => "IncentiveClaimed",
            Self::LevelUp => "LevelUp",
        }
    }

    pub fn topic0(self) -> B256 {
        match self {
            Self::UserRegistered => IHelpContract::UserRegistered::SIGNATURE_HASH,
            Self::DonationReceived => IHelpContract::DonationReceived::SIGNATURE_HASH,
            Self::VoluntaryDonation => IHelpContract::VoluntaryDonation::SIGNATURE_HASH,
            Self::Withdrawal => IHelpContract::Withdrawal::SIGNATURE_HASH,
            Self::IncentiveGranted => IHelpContract::IncentiveGranted::SIGNATURE_HASH,
            Self::IncentiveClaimed => IHelpContract::IncentiveClaimed::SIGNATURE_HASH,
            Self::LevelUp => IHelpContract::LevelUp::SIGNATURE_HASH,
        }
    }

    /// Whether a failed log fetch for this kind aborts the whole scan.
    ///
    /// Only registrations are load-bearing for every other category; the
    /// rest are logged and the window is skipped for that filter.
    pub fn halts_scan_on_fetch_error(self) -> bool {
        matches!(self, Self::UserRegistered)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Contract event with its payload decoded into domain units.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContractEvent {
    UserRegistered {
        user: Address,
        sponsor: Address,
    },
    DonationReceived {
        user: Address,
        amount: Decimal,
        level: u64,
        new_balance: Decimal,
    },
    VoluntaryDonation {
        user: Address,
        amount: Decimal,
        reserve_pool: Decimal,
    },
    Withdrawal {
        user: Address,
        amount_usdt: Decimal,
        amount_help: Decimal,
        remaining_balance: Decimal,
    },
    IncentiveGranted {
        user: Address,
        amount: Decimal,
        unlock_timestamp: u64,
    },
    IncentiveClaimed {
        user: Address,
        amount: Decimal,
    },
    LevelUp {
        user: Address,
        new_level: u64,
        remaining_balance: Decimal,
    },
}

impl ContractEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::UserRegistered { .. } => EventKind::UserRegistered,
            Self::DonationReceived { .. } => EventKind::DonationReceived,
            Self::VoluntaryDonation { .. } => EventKind::VoluntaryDonation,
            Self::Withdrawal { .. } => EventKind::Withdrawal,
            Self::IncentiveGranted { .. } => EventKind::IncentiveGranted,
            Self::IncentiveClaimed { .. } => EventKind::IncentiveClaimed,
            Self::LevelUp { .. } => EventKind::LevelUp,
        }
    }

    /// Address of the participant the event is about.
    pub fn user(&self) -> Address {
        match self {
            Self::UserRegistered { user, .. }
            | Self::DonationReceived { user, .. }
            | Self::VoluntaryDonation { user, .. }
            | Self::Withdrawal { user, .. }
            | Self::IncentiveGranted { user, .. }
            | Self::IncentiveClaimed { user, .. }
            | Self::LevelUp { user, .. } => *user,
        }
    }

    /// Decodes a raw log, checking that it belongs to `kind`.
    pub fn decode(kind: EventKind, log: &RpcLog) -> Result<Self> {
        match log.topics.first() {
            Some(topic) if *topic == kind.topic0() => {}
            Some(topic) => {
                return Err(eyre!("log topic {topic} does not match {kind}"));
            }
            None => return Err(eyre!("anonymous log cannot be decoded as {kind}")),
        }
        let topics = log.topics.iter().copied();
        let data = log.data.as_ref();
        let event = match kind {
            EventKind::UserRegistered => {
                let ev = IHelpContract::UserRegistered::decode_raw_log(topics, data, true)?;
                Self::UserRegistered {
                    user: ev.user,
                    sponsor: ev.sponsor,
                }
            }
            EventKind::DonationReceived => {
                let ev = IHelpContract::DonationReceived::decode_raw_log(topics, data, true)?;
                Self::DonationReceived {
                    user: ev.user,
                    amount: units::usdt(ev.amount)?,
                    level: units::to_u64(ev.level, "level")?,
                    new_balance: units::usdt(ev.newBalance)?,
                }
            }
            EventKind::VoluntaryDonation => {
                let ev = IHelpContract::VoluntaryDonation::decode_raw_log(topics, data, true)?;
                Self::VoluntaryDonation {
                    user: ev.user,
                    amount: units::usdt(ev.amount)?,
                    reserve_pool: units::usdt(ev.reservePool)?,
                }
            }
            EventKind::Withdrawal => {
                let ev = IHelpContract::Withdrawal::decode_raw_log(topics, data, true)?;
                Self::Withdrawal {
                    user: ev.user,
                    amount_usdt: units::usdt(ev.amountUsdt)?,
                    amount_help: units::help(ev.amountHelp)?,
                    remaining_balance: units::usdt(ev.remainingBalance)?,
                }
            }
            EventKind::IncentiveGranted => {
                let ev = IHelpContract::IncentiveGranted::decode_raw_log(topics, data, true)?;
                Self::IncentiveGranted {
                    user: ev.user,
                    amount: units::help(ev.amount)?,
                    unlock_timestamp: units::to_u64(ev.unlockTimestamp, "unlockTimestamp")?,
                }
            }
            EventKind::IncentiveClaimed => {
                let ev = IHelpContract::IncentiveClaimed::decode_raw_log(topics, data, true)?;
                Self::IncentiveClaimed {
                    user: ev.user,
                    amount: units::help(ev.amount)?,
                }
            }
            EventKind::LevelUp => {
                let ev = IHelpContract::LevelUp::decode_raw_log(topics, data, true)?;
                Self::LevelUp {
                    user: ev.user,
                    new_level: units::to_u64(ev.newLevel, "newLevel")?,
                    remaining_balance: units::usdt(ev.remainingBalance)?,
                }
            }
        };
        Ok(event)
    }
}

/// On-chain queue and incentive state for one participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    pub is_in_queue: bool,
    pub queue_position: u64,
    pub locked_amount: Decimal,
    pub unlock_timestamp: u64,
}

/// Read-only view calls against the scheme contract and its two tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContractReader {
    pub contract: Address,
    pub usdt_token: Address,
    pub help_token: Address,
}

impl ContractReader {
    /// Looks up the token addresses the contract was deployed with.
    pub async fn resolve(rpc: &dyn EvmRpc, contract: Address) -> Result<Self> {
        let usdt_token = call::<IHelpContract::usdtCall>(rpc, contract, IHelpContract::usdtCall {})
            .await
            .wrap_err("failed to read usdt() from contract")?
            ._0;
        let help_token =
            call::<IHelpContract::helpTokenCall>(rpc, contract, IHelpContract::helpTokenCall {})
                .await
                .wrap_err("failed to read helpToken() from contract")?
                ._0;
        if usdt_token == Address::ZERO || help_token == Address::ZERO {
            return Err(eyre!("contract reports a zero token address"));
        }
        let reader = Self {
            contract,
            usdt_token,
            help_token,
        };
        reader.check_token_decimals(rpc).await;
        Ok(reader)
    }

    async fn check_token_decimals(&self, rpc: &dyn EvmRpc) {
        for (token, address, expected) in [
            ("USDT", self.usdt_token, units::USDT_DECIMALS),
            ("HELP", self.help_token, units::HELP_DECIMALS),
        ] {
            match self.token_decimals(rpc, address).await {
                Ok(decimals) if u32::from(decimals) == expected => {}
                Ok(decimals) => warn!(
                    token,
                    %address,
                    decimals,
                    expected,
                    "token decimals differ from the fixed decoding scale"
                ),
                Err(err) => warn!(token, %address, error = %err, "failed to read token decimals"),
            }
        }
    }

    pub async fn entry_fee(&self, rpc: &dyn EvmRpc) -> Result<Decimal> {
        let ret = call::<IHelpContract::ENTRY_FEECall>(
            rpc,
            self.contract,
            IHelpContract::ENTRY_FEECall {},
        )
        .await
        .wrap_err("failed to read ENTRY_FEE()")?;
        units::usdt(ret._0)
    }

    pub async fn help_price(&self, rpc: &dyn EvmRpc) -> Result<Decimal> {
        let ret = call::<IHelpContract::getHelpPriceCall>(
            rpc,
            self.contract,
            IHelpContract::getHelpPriceCall {},
        )
        .await
        .wrap_err("failed to read getHelpPrice()")?;
        units::price(ret._0)
    }

    pub async fn level_amount(&self, rpc: &dyn EvmRpc, level: u64) -> Result<Decimal> {
        let ret = call::<IHelpContract::levelAmountsCall>(
            rpc,
            self.contract,
            IHelpContract::levelAmountsCall {
                level: U256::from(level),
            },
        )
        .await
        .wrap_err_with(|| format!("failed to read levelAmounts({level})"))?;
        units::usdt(ret._0)
    }

    pub async fn queue_info(&self, rpc: &dyn EvmRpc, user: Address) -> Result<QueueInfo> {
        let ret = call::<IHelpContract::getUserQueueAndIncentiveInfoCall>(
            rpc,
            self.contract,
            IHelpContract::getUserQueueAndIncentiveInfoCall { user },
        )
        .await
        .wrap_err_with(|| format!("failed to read queue info for {user}"))?;
        Ok(QueueInfo {
            is_in_queue: ret.isInQueue,
            queue_position: units::to_u64(ret.queuePosition, "queuePosition")?,
            locked_amount: units::help(ret.lockedAmount)?,
            unlock_timestamp: units::to_u64(ret.unlockTimestamp, "unlockTimestamp")?,
        })
    }

    /// HELP balance of `holder`.
    pub async fn help_balance(&self, rpc: &dyn EvmRpc, holder: Address) -> Result<Decimal> {
        let raw = self.balance_of(rpc, self.help_token, holder).await?;
        units::help(raw)
    }

    /// USDT balance of `holder`.
    pub async fn usdt_balance(&self, rpc: &dyn EvmRpc, holder: Address) -> Result<Decimal> {
        let raw = self.balance_of(rpc, self.usdt_token, holder).await?;
        units::usdt(raw)
    }

    /// ERC-20 allowance granted by `owner` to the scheme contract, in raw units.
    pub async fn allowance(&self, rpc: &dyn EvmRpc, token: Address, owner: Address) -> Result<U256> {
        let ret = call::<IERC20::allowanceCall>(
            rpc,
            token,
            IERC20::allowanceCall {
                owner,
                spender: self.contract,
            },
        )
        .await
        .wrap_err_with(|| format!("failed to read allowance on {token}"))?;
        Ok(ret._0)
    }

    pub async fn token_decimals(&self, rpc: &dyn EvmRpc, token: Address) -> Result<u8> {
        let ret = call::<IERC20::decimalsCall>(rpc, token, IERC20::decimalsCall {})
            .await
            .wrap_err_with(|| format!("failed to read decimals() on {token}"))?;
        Ok(ret._0)
    }

    async fn balance_of(&self, rpc: &dyn EvmRpc, token: Address, holder: Address) -> Result<U256> {
        let ret = call::<IERC20::balanceOfCall>(rpc, token, IERC20::balanceOfCall { account: holder })
            .await
            .wrap_err_with(|| format!("failed to read balanceOf({holder}) on {token}"))?;
        Ok(ret._0)
    }
}

async fn call<C: SolCall>(rpc: &dyn EvmRpc, to: Address, request: C) -> Result<C::Return> {
    let output = rpc.call(to, Bytes::from(request.abi_encode())).await?;
    C::abi_decode_returns(&output, true)
        .map_err(|err| eyre!("failed to decode {} return data: {err}", C::SIGNATURE))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{event_log, LogMeta};
    use std::str::FromStr;

    fn user() -> Address {
        Address::repeat_byte(0x11)
    }

    #[test]
    fn decodes_donation_with_named_fields() {
        let ev = IHelpContract::DonationReceived {
            user: user(),
            amount: U256::from(10_000_000u64),
            level: U256::from(2u64),
            newBalance: U256::from(30_000_000u64),
        };
        let log = event_log(&ev, LogMeta::at(120, 0x01));
        let decoded = ContractEvent::decode(EventKind::DonationReceived, &log).unwrap();
        assert_eq!(
            decoded,
            ContractEvent::DonationReceived {
                user: user(),
                amount: Decimal::from(10),
                level: 2,
                new_balance: Decimal::from(30),
            }
        );
        assert_eq!(decoded.kind(), EventKind::DonationReceived);
        assert_eq!(decoded.user(), user());
    }

    #[test]
    fn decodes_withdrawal_with_mixed_scales() {
        let ev = IHelpContract::Withdrawal {
            user: user(),
            amountUsdt: U256::from(2_500_000u64),
            amountHelp: U256::from(500_000_000_000_000_000u128),
            remainingBalance: U256::ZERO,
        };
        let log = event_log(&ev, LogMeta::at(7, 0x02));
        let decoded = ContractEvent::decode(EventKind::Withdrawal, &log).unwrap();
        assert_eq!(
            decoded,
            ContractEvent::Withdrawal {
                user: user(),
                amount_usdt: Decimal::from_str("2.5").unwrap(),
                amount_help: Decimal::from_str("0.5").unwrap(),
                remaining_balance: Decimal::ZERO,
            }
        );
    }

    #[test]
    fn rejects_log_of_another_kind() {
        let ev = IHelpContract::LevelUp {
            user: user(),
            newLevel: U256::from(3u64),
            remainingBalance: U256::ZERO,
        };
        let log = event_log(&ev, LogMeta::at(1, 0x03));
        let err = ContractEvent::decode(EventKind::UserRegistered, &log).expect_err("wrong topic");
        assert!(err.to_string().contains("does not match"), "{err}");
    }

    #[test]
    fn only_registrations_halt_the_scan() {
        let halting: Vec<_> = EventKind::ALL
            .into_iter()
            .filter(|kind| kind.halts_scan_on_fetch_error())
            .collect();
        assert_eq!(halting, vec![EventKind::UserRegistered]);
    }

    #[test]
    fn topics_are_distinct() {
        let mut topics: Vec<_> = EventKind::ALL.iter().map(|kind| kind.topic0()).collect();
        topics.sort();
        topics.dedup();
        assert_eq!(topics.len(), EventKind::ALL.len());
    }
}
