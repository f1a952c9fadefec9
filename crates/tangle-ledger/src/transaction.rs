//! Value transfer transactions.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use tangle_store::StorableObject;
use tangle_types::{Address, Balance, OutputId, TransactionId};

/// Balances produced per address.
pub type Outputs = BTreeMap<Address, Vec<Balance>>;

/// A decoded value transfer: the outputs it consumes and the balances it
/// creates on each address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    id: TransactionId,
    inputs: Vec<OutputId>,
    outputs: Outputs,
}

impl Transaction {
    pub fn new(inputs: Vec<OutputId>, outputs: Outputs) -> Self {
        let id = TransactionId::from_essence(&essence(&inputs, &outputs));
        Self {
            id,
            inputs,
            outputs,
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn inputs(&self) -> &[OutputId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &Outputs {
        &self.outputs
    }

    /// The first input listed more than once, if any.
    pub fn duplicate_input(&self) -> Option<OutputId> {
        let mut seen = BTreeSet::new();
        self.inputs.iter().copied().find(|input| !seen.insert(*input))
    }

    /// Ids of the outputs this transaction creates.
    pub fn output_ids(&self) -> impl Iterator<Item = OutputId> + '_ {
        self.outputs
            .keys()
            .map(move |address| OutputId::new(*address, self.id))
    }
}

impl StorableObject for Transaction {
    fn object_key(&self) -> Vec<u8> {
        self.id.as_bytes().to_vec()
    }
}

/// Canonical byte encoding of inputs and outputs. Outputs are ordered by
/// address, so equal transfers always hash to the same id.
fn essence(inputs: &[OutputId], outputs: &Outputs) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + inputs.len() * OutputId::LENGTH + outputs.len() * 80);
    buf.extend_from_slice(&(inputs.len() as u32).to_le_bytes());
    for input in inputs {
        buf.extend_from_slice(&input.to_bytes());
    }
    buf.extend_from_slice(&(outputs.len() as u32).to_le_bytes());
    for (address, balances) in outputs {
        buf.extend_from_slice(address.as_bytes());
        buf.extend_from_slice(&(balances.len() as u32).to_le_bytes());
        for balance in balances {
            buf.extend_from_slice(balance.color.as_bytes());
            buf.extend_from_slice(&balance.value.to_le_bytes());
        }
    }
    buf
}
