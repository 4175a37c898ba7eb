//! Fee overrides for deployment transactions

use crate::config::FeeOverrides;

use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Eip1559TransactionRequest, TransactionRequest, U256};

const GWEI: u64 = 1_000_000_000;

/// Gas price types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GasPrice {
    Legacy(U256),
    Eip1559 {
        max_fee_per_gas: U256,
        max_priority_fee_per_gas: U256,
    },
}

impl GasPrice {
    /// Price pinned by the chain's fee overrides, if any. A priority fee alone
    /// is not enough to pick a pricing model, so it is ignored without a max fee.
    pub fn from_overrides(overrides: &FeeOverrides) -> Option<Self> {
        let max_fee = overrides.max_fee_per_gas_gwei.map(gwei)?;
        Some(match overrides.max_priority_fee_per_gas_gwei {
            Some(priority) => GasPrice::Eip1559 {
                max_fee_per_gas: max_fee,
                max_priority_fee_per_gas: std::cmp::min(gwei(priority), max_fee),
            },
            None => GasPrice::Legacy(max_fee),
        })
    }
}

fn gwei(value: u64) -> U256 {
    U256::from(value) * U256::from(GWEI)
}

/// Build a typed transaction with the chain's overrides applied. Fields left
/// unset are filled by the signer middleware at send time.
pub fn build_transaction(
    to: Option<ethers::types::Address>,
    data: ethers::types::Bytes,
    overrides: Option<&FeeOverrides>,
) -> TypedTransaction {
    let gas_limit = overrides.and_then(|o| o.gas_limit).map(U256::from);
    let price = overrides.and_then(GasPrice::from_overrides);

    match price {
        Some(GasPrice::Eip1559 {
            max_fee_per_gas,
            max_priority_fee_per_gas,
        }) => {
            let mut tx = Eip1559TransactionRequest::new()
                .data(data)
                .max_fee_per_gas(max_fee_per_gas)
                .max_priority_fee_per_gas(max_priority_fee_per_gas);
            if let Some(to) = to {
                tx = tx.to(to);
            }
            if let Some(gas) = gas_limit {
                tx = tx.gas(gas);
            }
            TypedTransaction::Eip1559(tx)
        }
        Some(GasPrice::Legacy(price)) => {
            let mut tx = TransactionRequest::new().data(data).gas_price(price);
            if let Some(to) = to {
                tx = tx.to(to);
            }
            if let Some(gas) = gas_limit {
                tx = tx.gas(gas);
            }
            TypedTransaction::Legacy(tx)
        }
        None => {
            let mut tx = TransactionRequest::new().data(data);
            if let Some(to) = to {
                tx = tx.to(to);
            }
            if let Some(gas) = gas_limit {
                tx = tx.gas(gas);
            }
            TypedTransaction::Legacy(tx)
        }
    }
}
