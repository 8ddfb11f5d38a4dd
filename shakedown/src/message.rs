//! Messages flowing from producer to consumer.
//!
//! The payload is an opaque [`Payment`] record; the only thing the pipeline
//! interprets is the stability header.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::random::RandomProvider;
use crate::stability::StabilityInstruction;

/// Header carrying the [`StabilityInstruction`].
pub const STABILITY_HEADER: &str = "ServerStability";

/// Opaque structured payload used to exercise the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Payment {
    /// Card number.
    pub card_number: String,
    /// Expiry date.
    pub expiry_date: String,
    /// Card verification value.
    pub cvv: String,
    /// Amount, as text.
    pub amount: String,
    /// Currency code.
    pub currency: String,
}

impl Payment {
    /// Generate a random payment.
    pub fn generate<R: RandomProvider>(random: &R) -> Self {
        const CURRENCIES: [&str; 5] = ["DKK", "EUR", "USD", "SEK", "NOK"];

        let card_number = (0..4)
            .map(|_| format!("{:04}", random.random_range(0..10_000u32)))
            .collect::<Vec<_>>()
            .join(" ");
        let expiry_date = format!(
            "{:02}/{:02}",
            random.random_range(1..13u32),
            random.random_range(26..36u32)
        );
        let cvv = format!("{:03}", random.random_range(0..1000u32));
        let amount = format!(
            "{}.{:02}",
            random.random_range(1..10_000u32),
            random.random_range(0..100u32)
        );
        let currency = CURRENCIES[random.random_range(0..CURRENCIES.len())].to_string();

        Self {
            card_number,
            expiry_date,
            cvv,
            amount,
            currency,
        }
    }

    /// Pretty-printed JSON used in observations.
    pub fn summary(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| format!("{self:?}"))
    }
}

/// A message with string headers and a payment payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message identifier.
    pub id: String,
    /// Metadata headers.
    pub headers: BTreeMap<String, String>,
    /// The payload.
    pub payload: Payment,
}

impl Message {
    /// Create a message without headers.
    pub fn new(payload: Payment) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            headers: BTreeMap::new(),
            payload,
        }
    }

    /// Set the stability header.
    pub fn with_instruction(self, instruction: StabilityInstruction) -> Self {
        self.with_header(STABILITY_HEADER, instruction.as_header_value())
    }

    /// Set an arbitrary header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Look up a header by name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// The stability instruction, defaulting to Functional.
    pub fn instruction(&self) -> StabilityInstruction {
        StabilityInstruction::from_header(self.header(STABILITY_HEADER))
    }
}
