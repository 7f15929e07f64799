// Copyright 2018 Kodebox, Inc.
// This file is part of CodeChain.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Single account in the system.

use std::fmt;

use primitive_types::{H256, U256};
use rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream};

use crate::key::EMPTY_TREE_HASH;

/// Single account in the system. The storage root is recomputed by the
/// pre-commit behavior on every commit; bulk importers must write it as
/// `EMPTY_TREE_HASH`.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Account {
    balance: U256,
    nonce: u64,
    code_hash: H256,
    storage_root: H256,
}

impl Account {
    pub fn new(balance: U256, nonce: u64, code_hash: H256, storage_root: H256) -> Account {
        Account {
            balance,
            nonce,
            code_hash,
            storage_root,
        }
    }

    /// return the balance associated with this account.
    pub fn balance(&self) -> &U256 {
        &self.balance
    }

    /// return the nonce associated with this account.
    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn code_hash(&self) -> &H256 {
        &self.code_hash
    }

    pub fn storage_root(&self) -> &H256 {
        &self.storage_root
    }

    pub fn set_storage_root(&mut self, root: H256) {
        self.storage_root = root;
    }

    /// Increment the nonce of the account by one.
    pub fn inc_nonce(&mut self) {
        self.nonce += 1;
    }

    /// Increase account balance.
    pub fn add_balance(&mut self, x: &U256) {
        self.balance = self.balance + *x;
    }

    /// Decrease account balance.
    /// Panics if balance is less than `x`
    pub fn sub_balance(&mut self, x: &U256) {
        assert!(self.balance >= *x);
        self.balance = self.balance - *x;
    }

    /// Check if the account carries no state at all.
    pub fn is_null(&self) -> bool {
        self.balance.is_zero()
            && self.nonce == 0
            && self.code_hash.is_zero()
            && (self.storage_root.is_zero() || self.storage_root == EMPTY_TREE_HASH)
    }

    /// Decode a dictionary or store payload. An empty payload is the
    /// canonical form of "no such account".
    pub fn from_payload(bytes: &[u8]) -> Account {
        if bytes.is_empty() {
            return Account::default()
        }
        rlp::decode(bytes).expect("account payloads are written by this crate; qed")
    }
}

impl Encodable for Account {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(4);
        s.append(&self.balance);
        s.append(&self.nonce);
        s.append(&self.code_hash);
        s.append(&self.storage_root);
    }
}

impl Decodable for Account {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        Ok(Self {
            balance: rlp.val_at(0)?,
            nonce: rlp.val_at(1)?,
            code_hash: rlp.val_at(2)?,
            storage_root: rlp.val_at(3)?,
        })
    }
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Account").field("balance", &self.balance).field("nonce", &self.nonce).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rlpio() {
        let a = Account::new(69u8.into(), 3, H256::zero(), EMPTY_TREE_HASH);
        let b: Account = rlp::decode(&a.rlp_bytes()).unwrap();
        assert_eq!(a.balance(), b.balance());
        assert_eq!(a.nonce(), b.nonce());
        assert_eq!(a.code_hash(), b.code_hash());
        assert_eq!(a.storage_root(), b.storage_root());
    }

    #[test]
    fn empty_payload_is_null() {
        let a = Account::from_payload(&[]);
        assert!(a.is_null());
        assert_eq!(U256::zero(), *a.balance());
        assert_eq!(0, a.nonce());
    }

    #[test]
    fn balance() {
        let mut a = Account::new(69u8.into(), 0, H256::zero(), H256::zero());
        a.add_balance(&1u8.into());
        assert_eq!(U256::from(70u8), *a.balance());
        a.sub_balance(&2u8.into());
        assert_eq!(U256::from(68u8), *a.balance());
    }

    #[test]
    #[should_panic]
    fn negative_balance() {
        let mut a = Account::new(69u8.into(), 0, H256::zero(), H256::zero());
        a.sub_balance(&70u8.into());
    }

    #[test]
    fn nonce() {
        let mut a = Account::new(69u8.into(), 0, H256::zero(), H256::zero());
        a.inc_nonce();
        assert_eq!(1, a.nonce());
        a.inc_nonce();
        assert_eq!(2, a.nonce());
    }

    #[test]
    fn is_null() {
        let mut a = Account::new(0u8.into(), 0, H256::zero(), EMPTY_TREE_HASH);
        assert!(a.is_null());
        a.add_balance(&1u8.into());
        assert!(!a.is_null());
    }
}
