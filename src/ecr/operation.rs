//! Payment operation parameters and responses.
//!
//! `OperationParameters` is what the caller hands to the controller; it is
//! validated against its `OperationType` and mapped onto an
//! [`OutgoingRequest`] through a fixed per-type field table.
//! `OperationResponse` is built from a successful reply's params.

use serde::{Deserialize, Serialize};

use crate::ecr::protocol::*;

// ---------------------------------------------------------------------------
// Operation types
// ---------------------------------------------------------------------------

/// Payment operation requested by the cash register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Pay,
    ReturnPayment,
    CancelPayment,
    Authorisation,
    AuthConfirmation,
    CancelAuthorisation,
    PayWithCashWithdrawal,
}

impl OperationType {
    /// Protocol method for this operation. `None` when the terminal protocol
    /// has no method for it.
    pub fn method_name(self) -> Option<&'static str> {
        match self {
            OperationType::Pay => Some(METHOD_PURCHASE),
            OperationType::ReturnPayment => Some(METHOD_REFUND),
            OperationType::CancelPayment => Some(METHOD_WITHDRAWAL),
            OperationType::Authorisation => Some(METHOD_PREAUTHORIZATION),
            OperationType::AuthConfirmation => Some(METHOD_SALE_COMPLETION),
            OperationType::CancelAuthorisation => None,
            OperationType::PayWithCashWithdrawal => Some(METHOD_CASHBACK),
        }
    }

    fn requires_amount(self) -> bool {
        !matches!(
            self,
            OperationType::CancelPayment | OperationType::CancelAuthorisation
        )
    }
}

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

/// Input of a payment operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationParameters {
    pub operation_type: OperationType,
    /// Amount in cents.
    #[serde(default)]
    pub amount: i64,
    /// Discount in cents.
    #[serde(default)]
    pub discount: i64,
    /// Cash withdrawal part of a cashback purchase, in cents.
    #[serde(default)]
    pub cashback_amount: i64,
    pub merchant_id: Option<u32>,
    pub sub_merchant: Option<u32>,
    /// Retrieval reference number of the original transaction.
    pub rrn: Option<String>,
    /// Receipt / invoice number of the original transaction.
    pub receipt_number: Option<String>,
    /// Pay by face (biometrics).
    #[serde(default)]
    pub facepay: bool,
}

impl OperationParameters {
    pub fn new(operation_type: OperationType) -> Self {
        Self {
            operation_type,
            amount: 0,
            discount: 0,
            cashback_amount: 0,
            merchant_id: None,
            sub_merchant: None,
            rrn: None,
            receipt_number: None,
            facepay: false,
        }
    }

    /// A purchase of `amount` cents.
    pub fn pay(amount: i64) -> Self {
        Self {
            amount,
            ..Self::new(OperationType::Pay)
        }
    }

    /// A refund of `amount` cents against the transaction identified by `rrn`.
    pub fn refund(amount: i64, rrn: &str) -> Self {
        Self {
            amount,
            rrn: Some(rrn.to_string()),
            ..Self::new(OperationType::ReturnPayment)
        }
    }

    /// Fill unset merchant / biometrics fields from configured defaults.
    pub fn with_defaults(mut self, merchant_id: Option<u32>, facepay: bool) -> Self {
        if self.merchant_id.is_none() {
            self.merchant_id = merchant_id;
        }
        self.facepay |= facepay;
        self
    }

    /// Check the fields the operation type requires.
    pub fn validate(&self) -> Result<(), String> {
        let ty = self.operation_type;
        if ty.requires_amount() && self.amount <= 0 {
            return Err(format!("{ty:?}: amount must be positive"));
        }
        if self.discount < 0 {
            return Err(format!("{ty:?}: discount cannot be negative"));
        }
        match ty {
            OperationType::ReturnPayment
            | OperationType::AuthConfirmation
            | OperationType::CancelAuthorisation
                if is_blank(&self.rrn) =>
            {
                Err(format!("{ty:?}: rrn is required"))
            }
            OperationType::CancelPayment if is_blank(&self.receipt_number) => {
                Err(format!("{ty:?}: receipt number is required"))
            }
            OperationType::PayWithCashWithdrawal if self.cashback_amount <= 0 => {
                Err(format!("{ty:?}: cashback amount must be positive"))
            }
            _ => Ok(()),
        }
    }

    /// Build the request for this operation.
    pub fn to_request(&self) -> Result<OutgoingRequest, String> {
        let no_method = || format!("Operation {:?} has no protocol method", self.operation_type);
        let method = self.operation_type.method_name().ok_or_else(no_method)?;

        let merchant_id = self.merchant_id.unwrap_or(0).to_string();
        let sub_merchant = self
            .sub_merchant
            .map(|s| s.to_string())
            .unwrap_or_default();
        let rrn = self.rrn.clone().unwrap_or_default();
        let request = OutgoingRequest::new(method);

        let request = match self.operation_type {
            OperationType::Pay => request
                .with_param("amount", format_amount(self.amount))
                .with_param("discount", format_amount(self.discount))
                .with_param("merchantId", merchant_id)
                .with_param("facepay", self.facepay)
                .with_param("subMerchant", sub_merchant),
            OperationType::ReturnPayment => request
                .with_param("amount", format_amount(self.amount))
                .with_param("discount", format_amount(self.discount))
                .with_param("merchantId", merchant_id)
                .with_param("rrn", rrn)
                .with_param("subMerchant", sub_merchant),
            OperationType::CancelPayment => request
                .with_param(
                    "invoiceNumber",
                    self.receipt_number.clone().unwrap_or_default(),
                )
                .with_param("merchantId", merchant_id),
            OperationType::Authorisation => request
                .with_param("amount", format_amount(self.amount))
                .with_param("merchantId", merchant_id),
            OperationType::AuthConfirmation => request
                .with_param("amount", format_amount(self.amount))
                .with_param("merchantId", merchant_id)
                .with_param("rrn", rrn),
            OperationType::PayWithCashWithdrawal => request
                .with_param("amount", format_amount(self.amount))
                .with_param("cashback", format_amount(self.cashback_amount))
                .with_param("merchantId", merchant_id),
            OperationType::CancelAuthorisation => return Err(no_method()),
        };
        Ok(request)
    }
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, |v| v.trim().is_empty())
}

/// Format an amount in cents as the terminal's decimal string (`1250` -> `"12.50"`).
pub fn format_amount(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.unsigned_abs();
    format!("{sign}{}.{:02}", abs / 100, abs % 100)
}

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

/// Result of a completed operation, as reported by the terminal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResponse {
    pub result: bool,
    pub amount: String,
    pub approval_code: String,
    pub capture_reference: String,
    pub card_expiry_date: String,
    pub card_holder_name: String,
    pub date: String,
    pub discount: String,
    pub hst_fld63_sf89: String,
    pub invoice_number: String,
    pub issuer_name: String,
    pub merchant: String,
    /// Masked card number.
    pub pan: String,
    pub pos_condition_code: String,
    pub pos_entry_mode: String,
    pub processing_code: String,
    /// Slip text.
    pub receipt: String,
    pub response_code: String,
    pub rrn: String,
    pub rrn_ext: String,
    pub terminal_id: String,
    pub time: String,
    pub track1: String,
    pub sign_verif: String,
    pub txn_type: String,
    pub trn_status: String,
    pub adv: String,
    pub adv2p: String,
    pub bank_acquirer: String,
    pub payment_system: String,
    pub sub_merchant: String,
}

impl OperationResponse {
    /// Copy the known keys out of a reply. Missing keys become empty strings.
    pub fn from_message(msg: &Message) -> Self {
        let get = |key: &str| msg.param(key).unwrap_or_default();
        Self {
            result: false,
            amount: get("amount"),
            approval_code: get("approvalCode"),
            capture_reference: get("captureReference"),
            card_expiry_date: get("cardExpiryDate"),
            card_holder_name: get("cardHolderName"),
            date: get("date"),
            discount: get("discount"),
            hst_fld63_sf89: get("hstFld63Sf89"),
            invoice_number: get("invoiceNumber"),
            issuer_name: get("issuerName"),
            merchant: get("merchant"),
            pan: get("pan"),
            pos_condition_code: get("posConditionCode"),
            pos_entry_mode: get("posEntryMode"),
            processing_code: get("processingCode"),
            receipt: get("receipt"),
            response_code: get(PARAM_RESPONSE_CODE),
            rrn: get("rrn"),
            rrn_ext: get("rrnExt"),
            terminal_id: get("terminalId"),
            time: get("time"),
            track1: get("track1"),
            sign_verif: get("signVerif"),
            txn_type: get("txnType"),
            trn_status: get("trnStatus"),
            adv: get("adv"),
            adv2p: get("adv2p"),
            bank_acquirer: get("bankAcquirer"),
            payment_system: get("paymentSystem"),
            sub_merchant: get("subMerchant"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
