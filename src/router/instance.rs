//! Router contract state machine
//!
//! One `RouterInstance` per chain. Every operation validates fully before it
//! mutates, so a rejected call leaves the router exactly as it was.

use super::message::{MessageKey, TransferMessage};
use super::InitializeArgs;
use crate::error::ProtocolError;
use crate::resolver::RouterRole;

use ethers::types::{Address, U256};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, info};

/// Seen-set of processed inbound messages
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplayGuard {
    seen: HashSet<MessageKey>,
}

impl ReplayGuard {
    pub fn check(&self, key: MessageKey) -> Result<(), ProtocolError> {
        if self.seen.contains(&key) {
            return Err(ProtocolError::DuplicateMessage {
                origin_chain_id: key.origin_chain_id,
                nonce: key.nonce,
            });
        }
        Ok(())
    }

    fn record(&mut self, key: MessageKey) {
        self.seen.insert(key);
    }

    pub fn contains(&self, key: &MessageKey) -> bool {
        self.seen.contains(key)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// State of an initialized router
#[derive(Debug, Clone, PartialEq)]
pub struct RouterState {
    name: String,
    symbol: String,
    role: RouterRole,
    owner: Address,
    connection_manager: Address,
    gas_paymaster: Address,
    /// Minted by the initializer
    initial_supply: U256,
    total_local_supply: U256,
    total_deposited: U256,
    balances: HashMap<Address, U256>,
    remote_routers: BTreeMap<u64, Address>,
    outbound_nonces: HashMap<u64, u64>,
    processed: ReplayGuard,
    /// Sent messages not yet acknowledged as delivered, by (destination, nonce)
    outbox: BTreeMap<(u64, u64), TransferMessage>,
    dispatched: u64,
}

impl RouterState {
    fn balance(&self, account: &Address) -> U256 {
        self.balances.get(account).copied().unwrap_or_default()
    }

    fn require_owner(&self, caller: Address) -> Result<(), ProtocolError> {
        if caller != self.owner {
            return Err(ProtocolError::NotOwner { caller });
        }
        Ok(())
    }

    fn debit_check(&self, account: &Address, amount: U256) -> Result<U256, ProtocolError> {
        let have = self.balance(account);
        if amount > have {
            return Err(ProtocolError::InsufficientBalance { have, need: amount });
        }
        Ok(have - amount)
    }
}

/// Public view of a router, for APIs and reports
#[derive(Debug, Clone, Serialize)]
pub struct RouterSummary {
    pub chain_id: u64,
    pub address: Address,
    pub initialized: bool,
    pub role: Option<RouterRole>,
    pub name: Option<String>,
    pub symbol: Option<String>,
    pub owner: Option<Address>,
    pub connection_manager: Option<Address>,
    pub gas_paymaster: Option<Address>,
    pub total_local_supply: U256,
    pub total_deposited: U256,
    pub dispatched: u64,
    /// Dispatched messages awaiting a delivery acknowledgement
    pub outbox: usize,
    pub processed: usize,
}

/// A deployed router on one chain
#[derive(Debug, Clone)]
pub struct RouterInstance {
    chain_id: u64,
    address: Address,
    state: Option<RouterState>,
}

impl RouterInstance {
    /// A freshly created, uninitialized router
    pub fn new(chain_id: u64, address: Address) -> Self {
        Self {
            chain_id,
            address,
            state: None,
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn is_initialized(&self) -> bool {
        self.state.is_some()
    }

    fn state(&self) -> Result<&RouterState, ProtocolError> {
        self.state.as_ref().ok_or(ProtocolError::NotInitialized)
    }

    fn state_mut(&mut self) -> Result<&mut RouterState, ProtocolError> {
        self.state.as_mut().ok_or(ProtocolError::NotInitialized)
    }

    /// One-time initializer. The caller becomes owner and receives the
    /// initial supply.
    pub fn initialize(
        &mut self,
        caller: Address,
        args: InitializeArgs,
    ) -> Result<(), ProtocolError> {
        if self.state.is_some() {
            return Err(ProtocolError::AlreadyInitialized);
        }

        let mut balances = HashMap::new();
        if !args.initial_supply.is_zero() {
            balances.insert(caller, args.initial_supply);
        }

        self.state = Some(RouterState {
            name: args.name,
            symbol: args.symbol,
            role: args.role,
            owner: caller,
            connection_manager: args.connection_manager,
            gas_paymaster: args.gas_paymaster,
            initial_supply: args.initial_supply,
            total_local_supply: args.initial_supply,
            total_deposited: U256::zero(),
            balances,
            remote_routers: BTreeMap::new(),
            outbound_nonces: HashMap::new(),
            processed: ReplayGuard::default(),
            outbox: BTreeMap::new(),
            dispatched: 0,
        });

        info!(
            chain_id = self.chain_id,
            router = ?self.address,
            role = ?args.role,
            "Router initialized"
        );
        Ok(())
    }

    /// Mint against a native-currency deposit. Mainnet router only.
    pub fn deposit(&mut self, caller: Address, amount: U256) -> Result<(), ProtocolError> {
        let state = self.state_mut()?;
        if !state.role.is_mainnet() {
            return Err(ProtocolError::NotMainnetRouter);
        }

        let supply = state
            .total_local_supply
            .checked_add(amount)
            .ok_or(ProtocolError::SupplyOverflow)?;
        let deposited = state
            .total_deposited
            .checked_add(amount)
            .ok_or(ProtocolError::SupplyOverflow)?;
        let balance = state
            .balance(&caller)
            .checked_add(amount)
            .ok_or(ProtocolError::SupplyOverflow)?;

        state.total_local_supply = supply;
        state.total_deposited = deposited;
        state.balances.insert(caller, balance);

        debug!(chain_id = self.chain_id, account = ?caller, %amount, "Deposit");
        Ok(())
    }

    /// Move balance between two accounts on this chain
    pub fn transfer(
        &mut self,
        from: Address,
        to: Address,
        amount: U256,
    ) -> Result<(), ProtocolError> {
        let state = self.state_mut()?;
        let from_after = state.debit_check(&from, amount)?;
        if from == to {
            return Ok(());
        }
        let to_after = state
            .balance(&to)
            .checked_add(amount)
            .ok_or(ProtocolError::SupplyOverflow)?;

        state.balances.insert(from, from_after);
        state.balances.insert(to, to_after);
        Ok(())
    }

    /// Burn `amount` from `sender` and emit a message for the destination chain.
    /// The debit and the outbox entry are one state transition.
    pub fn send_remote(
        &mut self,
        sender: Address,
        destination_chain_id: u64,
        recipient: Address,
        amount: U256,
    ) -> Result<TransferMessage, ProtocolError> {
        let chain_id = self.chain_id;
        let origin_router = self.address;
        let state = self.state_mut()?;

        if destination_chain_id == chain_id {
            return Err(ProtocolError::LocalDestination { chain_id });
        }
        if !state.remote_routers.contains_key(&destination_chain_id) {
            return Err(ProtocolError::UnknownRouter {
                domain: destination_chain_id,
            });
        }
        let sender_after = state.debit_check(&sender, amount)?;
        let supply_after = state
            .total_local_supply
            .checked_sub(amount)
            .ok_or(ProtocolError::SupplyOverflow)?;

        let nonce = state
            .outbound_nonces
            .get(&destination_chain_id)
            .copied()
            .unwrap_or(0);
        let message = TransferMessage {
            origin_chain_id: chain_id,
            origin_router,
            destination_chain_id,
            recipient,
            amount,
            nonce,
        };

        state.balances.insert(sender, sender_after);
        state.total_local_supply = supply_after;
        state.outbound_nonces.insert(destination_chain_id, nonce + 1);
        state
            .outbox
            .insert((destination_chain_id, nonce), message.clone());
        state.dispatched += 1;

        info!(
            origin = chain_id,
            destination = destination_chain_id,
            nonce,
            %amount,
            id = %hex::encode(message.id()),
            "Remote transfer dispatched"
        );
        Ok(message)
    }

    /// Credit a message relayed from an enrolled remote router. A message is
    /// processed at most once.
    pub fn receive_remote(&mut self, message: &TransferMessage) -> Result<(), ProtocolError> {
        let chain_id = self.chain_id;
        let state = self.state_mut()?;

        if message.destination_chain_id != chain_id {
            return Err(ProtocolError::WrongDestination {
                expected: chain_id,
                actual: message.destination_chain_id,
            });
        }
        match state.remote_routers.get(&message.origin_chain_id) {
            Some(router) if *router == message.origin_router => {}
            _ => {
                return Err(ProtocolError::UnauthorizedSender {
                    origin_chain_id: message.origin_chain_id,
                    sender: message.origin_router,
                })
            }
        }
        state.processed.check(message.key())?;

        let supply = state
            .total_local_supply
            .checked_add(message.amount)
            .ok_or(ProtocolError::SupplyOverflow)?;
        let balance = state
            .balance(&message.recipient)
            .checked_add(message.amount)
            .ok_or(ProtocolError::SupplyOverflow)?;

        state.processed.record(message.key());
        state.total_local_supply = supply;
        state.balances.insert(message.recipient, balance);

        info!(
            origin = message.origin_chain_id,
            destination = chain_id,
            nonce = message.nonce,
            amount = %message.amount,
            "Remote transfer received"
        );
        Ok(())
    }

    /// Register the router that speaks for `domain`. Re-enrolling replaces it.
    pub fn enroll_remote_router(
        &mut self,
        caller: Address,
        domain: u64,
        router: Address,
    ) -> Result<(), ProtocolError> {
        let state = self.state_mut()?;
        state.require_owner(caller)?;
        state.remote_routers.insert(domain, router);
        Ok(())
    }

    pub fn transfer_ownership(
        &mut self,
        caller: Address,
        new_owner: Address,
    ) -> Result<(), ProtocolError> {
        let state = self.state_mut()?;
        state.require_owner(caller)?;
        state.owner = new_owner;
        Ok(())
    }

    pub fn balance_of(&self, account: Address) -> Result<U256, ProtocolError> {
        Ok(self.state()?.balance(&account))
    }

    pub fn total_local_supply(&self) -> Result<U256, ProtocolError> {
        Ok(self.state()?.total_local_supply)
    }

    pub fn initial_supply(&self) -> Result<U256, ProtocolError> {
        Ok(self.state()?.initial_supply)
    }

    pub fn total_deposited(&self) -> Result<U256, ProtocolError> {
        Ok(self.state()?.total_deposited)
    }

    /// Sum of all account balances on this chain
    pub fn total_balances(&self) -> Result<U256, ProtocolError> {
        Ok(self
            .state()?
            .balances
            .values()
            .fold(U256::zero(), |acc, b| acc.saturating_add(*b)))
    }

    pub fn role(&self) -> Result<RouterRole, ProtocolError> {
        Ok(self.state()?.role)
    }

    pub fn owner(&self) -> Result<Address, ProtocolError> {
        Ok(self.state()?.owner)
    }

    pub fn remote_router(&self, domain: u64) -> Result<Option<Address>, ProtocolError> {
        Ok(self.state()?.remote_routers.get(&domain).copied())
    }

    /// Sent messages still awaiting delivery, by destination then nonce
    pub fn outbox(&self) -> Result<Vec<TransferMessage>, ProtocolError> {
        Ok(self.state()?.outbox.values().cloned().collect())
    }

    /// Drop a delivered message from the outbox. Returns false when it was
    /// not there, e.g. after an earlier acknowledgement.
    pub fn acknowledge_delivery(
        &mut self,
        destination_chain_id: u64,
        nonce: u64,
    ) -> Result<bool, ProtocolError> {
        let state = self.state_mut()?;
        Ok(state.outbox.remove(&(destination_chain_id, nonce)).is_some())
    }

    pub fn is_processed(&self, key: &MessageKey) -> bool {
        self.state
            .as_ref()
            .map(|s| s.processed.contains(key))
            .unwrap_or(false)
    }

    pub fn summary(&self) -> RouterSummary {
        let state = self.state.as_ref();
        RouterSummary {
            chain_id: self.chain_id,
            address: self.address,
            initialized: state.is_some(),
            role: state.map(|s| s.role),
            name: state.map(|s| s.name.clone()),
            symbol: state.map(|s| s.symbol.clone()),
            owner: state.map(|s| s.owner),
            connection_manager: state.map(|s| s.connection_manager),
            gas_paymaster: state.map(|s| s.gas_paymaster),
            total_local_supply: state.map(|s| s.total_local_supply).unwrap_or_default(),
            total_deposited: state.map(|s| s.total_deposited).unwrap_or_default(),
            dispatched: state.map(|s| s.dispatched).unwrap_or(0),
            outbox: state.map(|s| s.outbox.len()).unwrap_or(0),
            processed: state.map(|s| s.processed.len()).unwrap_or(0),
        }
    }

    #[cfg(test)]
    pub(crate) fn snapshot(&self) -> Option<RouterState> {
        self.state.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAINNET: u64 = 80001;
    const SECONDARY: u64 = 5;

    fn owner() -> Address {
        Address::from_low_u64_be(0xaa)
    }

    fn depositor() -> Address {
        Address::from_low_u64_be(0xd0)
    }

    fn recipient() -> Address {
        Address::from_low_u64_be(0xee)
    }

    fn args(role: RouterRole, supply: u64) -> InitializeArgs {
        InitializeArgs {
            connection_manager: Address::from_low_u64_be(1),
            gas_paymaster: Address::from_low_u64_be(2),
            initial_supply: U256::from(supply),
            name: "Faucetful".to_string(),
            symbol: "FCT".to_string(),
            role,
        }
    }

    /// A mainnet and a secondary router enrolled with each other
    fn pair() -> (RouterInstance, RouterInstance) {
        let mut mainnet = RouterInstance::new(MAINNET, Address::from_low_u64_be(0x100));
        let mut secondary = RouterInstance::new(SECONDARY, Address::from_low_u64_be(0x200));
        mainnet.initialize(owner(), args(RouterRole::Mainnet, 0)).unwrap();
        secondary.initialize(owner(), args(RouterRole::Secondary, 0)).unwrap();
        mainnet
            .enroll_remote_router(owner(), SECONDARY, secondary.address())
            .unwrap();
        secondary
            .enroll_remote_router(owner(), MAINNET, mainnet.address())
            .unwrap();
        (mainnet, secondary)
    }

    #[test]
    fn initializer_runs_once() {
        let mut router = RouterInstance::new(MAINNET, Address::from_low_u64_be(0x100));
        assert!(!router.is_initialized());
        assert_eq!(router.balance_of(owner()), Err(ProtocolError::NotInitialized));

        router.initialize(owner(), args(RouterRole::Mainnet, 50)).unwrap();
        let after_first = router.snapshot();

        let err = router
            .initialize(depositor(), args(RouterRole::Secondary, 999))
            .unwrap_err();
        assert_eq!(err, ProtocolError::AlreadyInitialized);
        assert_eq!(router.snapshot(), after_first);
        assert_eq!(router.balance_of(owner()).unwrap(), U256::from(50));
        assert_eq!(router.owner().unwrap(), owner());
    }

    #[test]
    fn mainnet_deposit_mints() {
        let (mut mainnet, mut secondary) = pair();

        mainnet.deposit(depositor(), U256::from(37)).unwrap();
        assert_eq!(mainnet.balance_of(depositor()).unwrap(), U256::from(37));
        assert_eq!(mainnet.total_local_supply().unwrap(), U256::from(37));
        assert_eq!(mainnet.total_deposited().unwrap(), U256::from(37));

        let before = secondary.snapshot();
        let err = secondary.deposit(depositor(), U256::from(37)).unwrap_err();
        assert_eq!(err, ProtocolError::NotMainnetRouter);
        assert_eq!(secondary.snapshot(), before);
        assert_eq!(secondary.total_local_supply().unwrap(), U256::zero());
    }

    #[test]
    fn local_transfer_conserves_balance() {
        let (mut mainnet, _) = pair();
        mainnet.deposit(depositor(), U256::from(37)).unwrap();

        mainnet.transfer(depositor(), recipient(), U256::from(12)).unwrap();
        assert_eq!(mainnet.balance_of(depositor()).unwrap(), U256::from(25));
        assert_eq!(mainnet.balance_of(recipient()).unwrap(), U256::from(12));
        assert_eq!(mainnet.total_balances().unwrap(), U256::from(37));

        let err = mainnet
            .transfer(recipient(), depositor(), U256::from(13))
            .unwrap_err();
        assert_eq!(
            err,
            ProtocolError::InsufficientBalance {
                have: U256::from(12),
                need: U256::from(13)
            }
        );
    }

    #[test]
    fn self_transfer_is_a_no_op() {
        let (mut mainnet, _) = pair();
        mainnet.deposit(depositor(), U256::from(5)).unwrap();
        mainnet.transfer(depositor(), depositor(), U256::from(5)).unwrap();
        assert_eq!(mainnet.balance_of(depositor()).unwrap(), U256::from(5));
    }

    #[test]
    fn send_debits_and_receive_credits() {
        let (mut mainnet, mut secondary) = pair();
        mainnet.deposit(depositor(), U256::from(37)).unwrap();

        let message = mainnet
            .send_remote(depositor(), SECONDARY, recipient(), U256::from(12))
            .unwrap();
        assert_eq!(message.nonce, 0);
        assert_eq!(message.origin_router, mainnet.address());
        assert_eq!(mainnet.balance_of(depositor()).unwrap(), U256::from(25));
        assert_eq!(mainnet.total_local_supply().unwrap(), U256::from(25));
        assert_eq!(mainnet.outbox().unwrap(), vec![message.clone()]);
        assert_eq!(secondary.balance_of(recipient()).unwrap(), U256::zero());

        secondary.receive_remote(&message).unwrap();
        assert_eq!(secondary.balance_of(recipient()).unwrap(), U256::from(12));
        assert_eq!(secondary.total_local_supply().unwrap(), U256::from(12));
        assert!(secondary.is_processed(&message.key()));
    }

    #[test]
    fn acknowledged_messages_leave_the_outbox() {
        let (mut mainnet, mut secondary) = pair();
        mainnet.deposit(depositor(), U256::from(10)).unwrap();
        let first = mainnet
            .send_remote(depositor(), SECONDARY, recipient(), U256::from(3))
            .unwrap();
        let second = mainnet
            .send_remote(depositor(), SECONDARY, recipient(), U256::from(4))
            .unwrap();
        secondary.receive_remote(&first).unwrap();

        assert!(mainnet.acknowledge_delivery(SECONDARY, first.nonce).unwrap());
        assert!(!mainnet.acknowledge_delivery(SECONDARY, first.nonce).unwrap());
        assert_eq!(mainnet.outbox().unwrap(), vec![second]);

        let summary = mainnet.summary();
        assert_eq!(summary.dispatched, 2);
        assert_eq!(summary.outbox, 1);
        assert_eq!(summary.connection_manager, Some(Address::from_low_u64_be(1)));
        assert_eq!(summary.gas_paymaster, Some(Address::from_low_u64_be(2)));

        // Acknowledging never touches balances or supply
        assert_eq!(mainnet.total_local_supply().unwrap(), U256::from(3));
    }

    #[test]
    fn nonces_increase_per_destination() {
        let (mut mainnet, _) = pair();
        mainnet
            .enroll_remote_router(owner(), 43113, Address::from_low_u64_be(0x300))
            .unwrap();
        mainnet.deposit(depositor(), U256::from(10)).unwrap();

        let mut send = |destination| {
            mainnet
                .send_remote(depositor(), destination, recipient(), U256::one())
                .unwrap()
        };
        let a = send(SECONDARY);
        let b = send(43113);
        let c = send(SECONDARY);
        assert_eq!((a.nonce, b.nonce, c.nonce), (0, 0, 1));
    }

    #[test]
    fn failed_send_does_not_debit() {
        let (mut mainnet, _) = pair();
        mainnet.deposit(depositor(), U256::from(10)).unwrap();
        let before = mainnet.snapshot();

        let err = mainnet
            .send_remote(depositor(), SECONDARY, recipient(), U256::from(11))
            .unwrap_err();
        assert!(matches!(err, ProtocolError::InsufficientBalance { .. }));

        let err = mainnet
            .send_remote(depositor(), 1234, recipient(), U256::from(1))
            .unwrap_err();
        assert_eq!(err, ProtocolError::UnknownRouter { domain: 1234 });

        let err = mainnet
            .send_remote(depositor(), MAINNET, recipient(), U256::from(1))
            .unwrap_err();
        assert_eq!(err, ProtocolError::LocalDestination { chain_id: MAINNET });

        assert_eq!(mainnet.snapshot(), before);
    }

    #[test]
    fn replayed_message_credits_once() {
        let (mut mainnet, mut secondary) = pair();
        mainnet.deposit(depositor(), U256::from(37)).unwrap();
        let message = mainnet
            .send_remote(depositor(), SECONDARY, recipient(), U256::from(12))
            .unwrap();

        secondary.receive_remote(&message).unwrap();
        let after_first = secondary.snapshot();

        let err = secondary.receive_remote(&message).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::DuplicateMessage {
                origin_chain_id: MAINNET,
                nonce: 0
            }
        );
        assert_eq!(secondary.snapshot(), after_first);
        assert_eq!(secondary.balance_of(recipient()).unwrap(), U256::from(12));
    }

    #[test]
    fn receive_rejects_unknown_sender_and_wrong_destination() {
        let (mut mainnet, mut secondary) = pair();
        mainnet.deposit(depositor(), U256::from(37)).unwrap();
        let message = mainnet
            .send_remote(depositor(), SECONDARY, recipient(), U256::from(12))
            .unwrap();
        let before = secondary.snapshot();

        let mut forged = message.clone();
        forged.origin_router = Address::from_low_u64_be(0x666);
        assert!(matches!(
            secondary.receive_remote(&forged),
            Err(ProtocolError::UnauthorizedSender { .. })
        ));

        let mut misrouted = message.clone();
        misrouted.destination_chain_id = 43113;
        assert_eq!(
            secondary.receive_remote(&misrouted),
            Err(ProtocolError::WrongDestination {
                expected: SECONDARY,
                actual: 43113
            })
        );

        assert_eq!(secondary.snapshot(), before);
    }

    #[test]
    fn owner_only_administration() {
        let (mut mainnet, _) = pair();
        let err = mainnet
            .enroll_remote_router(depositor(), 10, Address::from_low_u64_be(9))
            .unwrap_err();
        assert_eq!(err, ProtocolError::NotOwner { caller: depositor() });

        mainnet.transfer_ownership(owner(), depositor()).unwrap();
        assert_eq!(mainnet.owner().unwrap(), depositor());
        mainnet
            .enroll_remote_router(depositor(), 10, Address::from_low_u64_be(9))
            .unwrap();
        assert_eq!(
            mainnet.remote_router(10).unwrap(),
            Some(Address::from_low_u64_be(9))
        );
    }

    #[test]
    fn uninitialized_router_rejects_operations() {
        let mut router = RouterInstance::new(SECONDARY, Address::from_low_u64_be(0x200));
        assert_eq!(
            router.deposit(depositor(), U256::one()),
            Err(ProtocolError::NotInitialized)
        );
        assert!(!router.summary().initialized);
    }
}
