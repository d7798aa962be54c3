//! API error type
//!
//! Every failure leaving the HTTP surface carries a stable numeric
//! code, a short machine tag and a human-readable hint, plus the
//! exchange's signed evidence where one exists, so wallets can verify
//! failures independently.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::Value;

use crate::db::DbError;
use crate::exchange::ExchangeError;
use crate::order::OrderError;
use crate::pay::{CoinErrorKind, PayError};
use crate::refund::RefundError;
use crate::tip::TipError;
use crate::track::TrackError;

/// Stable numeric error codes. Part of the wire protocol; never reuse.
pub mod codes {
    pub const BAD_REQUEST: u32 = 1000;
    pub const NOT_FOUND: u32 = 1001;
    pub const INTERNAL: u32 = 1002;
    pub const SERVER_BUSY: u32 = 1003;
    pub const GATEWAY_TIMEOUT: u32 = 1004;

    pub const ORDER_ID_EXISTS: u32 = 2001;
    pub const NO_ACTIVE_ACCOUNT: u32 = 2002;
    pub const INVALID_AMOUNT: u32 = 2003;
    pub const DEADLINE_IN_PAST: u32 = 2004;
    pub const ALREADY_CLAIMED: u32 = 2101;

    pub const PAY_COIN_SET_INVALID: u32 = 2201;
    pub const PAY_COIN_FAILURES: u32 = 2202;
    pub const PAY_EXCHANGE_UNAVAILABLE: u32 = 2203;
    pub const PAY_ABORT_AFTER_COMPLETION: u32 = 2204;

    pub const REFUND_EXCEEDS_CONTRACT: u32 = 2301;
    pub const REFUND_CONTRACT_NOT_PAID: u32 = 2302;

    pub const TRACK_UNKNOWN_DEPOSIT: u32 = 2401;
    pub const TRACK_AMOUNT_MISMATCH: u32 = 2402;
    pub const TRACK_ACCOUNT_MISMATCH: u32 = 2403;
    pub const TRACK_EXCHANGE_FAULT: u32 = 2404;

    pub const TIP_INSTANCE_DOES_NOT_TIP: u32 = 2501;
    pub const TIP_RESERVE_UNKNOWN: u32 = 2502;
    pub const TIP_RESERVE_EXPIRED: u32 = 2503;
    pub const TIP_INSUFFICIENT_FUNDS: u32 = 2504;
    pub const TIP_PICKUP_EXCEEDS: u32 = 2505;
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict {
        code: u32,
        tag: &'static str,
        hint: String,
        detail: Option<Value>,
    },
    PreconditionFailed {
        code: u32,
        tag: &'static str,
        hint: String,
    },
    FailedDependency {
        code: u32,
        tag: &'static str,
        hint: String,
        detail: Option<Value>,
    },
    ServiceUnavailable(String),
    GatewayTimeout(String),
    Busy,
    Internal(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Serialize)]
struct ErrorBody {
    code: u32,
    tag: &'static str,
    hint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<Value>,
}

impl ApiError {
    fn parts(self) -> (StatusCode, ErrorBody) {
        match self {
            ApiError::BadRequest(hint) => (
                StatusCode::BAD_REQUEST,
                ErrorBody {
                    code: codes::BAD_REQUEST,
                    tag: "bad-request",
                    hint,
                    detail: None,
                },
            ),
            ApiError::NotFound(hint) => (
                StatusCode::NOT_FOUND,
                ErrorBody {
                    code: codes::NOT_FOUND,
                    tag: "not-found",
                    hint,
                    detail: None,
                },
            ),
            ApiError::Conflict {
                code,
                tag,
                hint,
                detail,
            } => (
                StatusCode::CONFLICT,
                ErrorBody {
                    code,
                    tag,
                    hint,
                    detail,
                },
            ),
            ApiError::PreconditionFailed { code, tag, hint } => (
                StatusCode::PRECONDITION_FAILED,
                ErrorBody {
                    code,
                    tag,
                    hint,
                    detail: None,
                },
            ),
            ApiError::FailedDependency {
                code,
                tag,
                hint,
                detail,
            } => (
                StatusCode::FAILED_DEPENDENCY,
                ErrorBody {
                    code,
                    tag,
                    hint,
                    detail,
                },
            ),
            ApiError::ServiceUnavailable(hint) => (
                StatusCode::SERVICE_UNAVAILABLE,
                ErrorBody {
                    code: codes::PAY_EXCHANGE_UNAVAILABLE,
                    tag: "exchange-unavailable",
                    hint,
                    detail: None,
                },
            ),
            ApiError::GatewayTimeout(hint) => (
                StatusCode::GATEWAY_TIMEOUT,
                ErrorBody {
                    code: codes::GATEWAY_TIMEOUT,
                    tag: "timeout",
                    hint,
                    detail: None,
                },
            ),
            ApiError::Busy => (
                StatusCode::SERVICE_UNAVAILABLE,
                ErrorBody {
                    code: codes::SERVER_BUSY,
                    tag: "server-busy",
                    hint: "too many concurrent transactions, try again".to_string(),
                    detail: None,
                },
            ),
            ApiError::Internal(hint) => {
                tracing::error!(hint = %hint, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorBody {
                        code: codes::INTERNAL,
                        tag: "internal-error",
                        hint,
                        detail: None,
                    },
                )
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = self.parts();
        (status, Json(body)).into_response()
    }
}

impl From<DbError> for ApiError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::InstanceNotFound(id) => ApiError::NotFound(format!("instance {}", id)),
            DbError::OrderNotFound(id) => ApiError::NotFound(format!("order {}", id)),
            DbError::ContractNotFound(h) => ApiError::NotFound(format!("contract {}", h)),
            DbError::TipNotFound(id) => ApiError::NotFound(format!("tip {}", id)),
            DbError::Busy => ApiError::Busy,
            DbError::InvalidInput(hint) => ApiError::BadRequest(hint),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<OrderError> for ApiError {
    fn from(e: OrderError) -> Self {
        match e {
            OrderError::OrderIdExists(id) => ApiError::Conflict {
                code: codes::ORDER_ID_EXISTS,
                tag: "order-id-exists",
                hint: format!("order id {} is already in use", id),
                detail: None,
            },
            OrderError::NoActiveAccount => ApiError::PreconditionFailed {
                code: codes::NO_ACTIVE_ACCOUNT,
                tag: "no-active-account",
                hint: "instance has no active bank account".to_string(),
            },
            OrderError::InvalidAmount(hint) => ApiError::BadRequest(format!(
                "invalid amount: {} (code {})",
                hint,
                codes::INVALID_AMOUNT
            )),
            OrderError::DeadlineInPast => ApiError::BadRequest(format!(
                "deadline lies in the past (code {})",
                codes::DEADLINE_IN_PAST
            )),
            OrderError::NotFound(id) => ApiError::NotFound(format!("order {}", id)),
            OrderError::AlreadyClaimed(id) => ApiError::Conflict {
                code: codes::ALREADY_CLAIMED,
                tag: "already-claimed",
                hint: format!("order {} was claimed by a different wallet", id),
                detail: None,
            },
            OrderError::Db(db) => db.into(),
        }
    }
}

impl From<PayError> for ApiError {
    fn from(e: PayError) -> Self {
        match e {
            PayError::ContractNotFound(id) => ApiError::NotFound(format!("order {}", id)),
            PayError::CoinValidation(hint) => ApiError::Conflict {
                code: codes::PAY_COIN_SET_INVALID,
                tag: "coin-set-invalid",
                hint,
                detail: None,
            },
            PayError::UnknownExchange(url) => {
                ApiError::BadRequest(format!("exchange {} is not configured", url))
            }
            PayError::CoinErrors { errors } => {
                let protocol_fault = errors
                    .iter()
                    .any(|c| c.kind == CoinErrorKind::ExchangeProtocol);
                let detail = serde_json::to_value(&errors).ok();
                if protocol_fault {
                    ApiError::FailedDependency {
                        code: codes::PAY_COIN_FAILURES,
                        tag: "exchange-misbehaving",
                        hint: "an exchange returned inconsistent data".to_string(),
                        detail,
                    }
                } else {
                    ApiError::Conflict {
                        code: codes::PAY_COIN_FAILURES,
                        tag: "pay-coin-failures",
                        hint: "one or more coins were rejected".to_string(),
                        detail,
                    }
                }
            }
            PayError::ExchangeUnavailable(hint) => ApiError::ServiceUnavailable(hint),
            PayError::AbortAfterCompletion => ApiError::Conflict {
                code: codes::PAY_ABORT_AFTER_COMPLETION,
                tag: "abort-after-completion",
                hint: "payment already completed, abort refused".to_string(),
                detail: None,
            },
            PayError::Db(db) => db.into(),
            PayError::Refund(r) => r.into(),
        }
    }
}

impl From<RefundError> for ApiError {
    fn from(e: RefundError) -> Self {
        match e {
            RefundError::NotFound(id) => ApiError::NotFound(format!("order {}", id)),
            RefundError::ContractNotPaid => ApiError::Conflict {
                code: codes::REFUND_CONTRACT_NOT_PAID,
                tag: "contract-not-paid",
                hint: "refunds require a completed payment".to_string(),
                detail: None,
            },
            RefundError::ExceedsContractAmount => ApiError::Conflict {
                code: codes::REFUND_EXCEEDS_CONTRACT,
                tag: "refund-exceeds-contract",
                hint: "requested refund exceeds the contract amount".to_string(),
                detail: None,
            },
            RefundError::Db(db) => db.into(),
            RefundError::Internal(hint) => ApiError::Internal(hint),
        }
    }
}

impl From<TrackError> for ApiError {
    fn from(e: TrackError) -> Self {
        match e {
            TrackError::NotFound(id) => ApiError::NotFound(format!("order {}", id)),
            TrackError::NoDeposits => {
                ApiError::NotFound("no deposits recorded for this order".to_string())
            }
            TrackError::UnknownExchange(url) => {
                ApiError::BadRequest(format!("exchange {} is not configured", url))
            }
            TrackError::ExchangeReportedUnknownDeposit(hint) => ApiError::FailedDependency {
                code: codes::TRACK_UNKNOWN_DEPOSIT,
                tag: "unknown-deposit",
                hint,
                detail: None,
            },
            TrackError::AmountMismatch(hint) => ApiError::FailedDependency {
                code: codes::TRACK_AMOUNT_MISMATCH,
                tag: "amount-mismatch",
                hint,
                detail: None,
            },
            TrackError::MerchantAccountMismatch(hint) => ApiError::FailedDependency {
                code: codes::TRACK_ACCOUNT_MISMATCH,
                tag: "account-mismatch",
                hint,
                detail: None,
            },
            TrackError::Exchange(ex) => exchange_error(ex),
            TrackError::Db(db) => db.into(),
        }
    }
}

impl From<TipError> for ApiError {
    fn from(e: TipError) -> Self {
        match e {
            TipError::InstanceDoesNotTip => ApiError::PreconditionFailed {
                code: codes::TIP_INSTANCE_DOES_NOT_TIP,
                tag: "instance-does-not-tip",
                hint: "instance has no tipping reserve configured".to_string(),
            },
            TipError::ReserveUnknown => ApiError::PreconditionFailed {
                code: codes::TIP_RESERVE_UNKNOWN,
                tag: "reserve-unknown",
                hint: "tip reserve unknown at the exchange".to_string(),
            },
            TipError::ReserveExpired => ApiError::PreconditionFailed {
                code: codes::TIP_RESERVE_EXPIRED,
                tag: "reserve-expired",
                hint: "tip reserve has expired".to_string(),
            },
            TipError::InsufficientFunds => ApiError::PreconditionFailed {
                code: codes::TIP_INSUFFICIENT_FUNDS,
                tag: "insufficient-funds",
                hint: "tip reserve balance is insufficient".to_string(),
            },
            TipError::TipNotFound(id) => ApiError::NotFound(format!("tip {}", id)),
            TipError::PickupExceedsTip => ApiError::Conflict {
                code: codes::TIP_PICKUP_EXCEEDS,
                tag: "pickup-exceeds-tip",
                hint: "pickup exceeds the tip's remaining amount".to_string(),
                detail: None,
            },
            TipError::InvalidPlanchet(hint) => ApiError::BadRequest(hint),
            TipError::Exchange(ex) => exchange_error(ex),
            TipError::Db(db) => db.into(),
        }
    }
}

fn exchange_error(e: ExchangeError) -> ApiError {
    if e.is_retryable() {
        ApiError::ServiceUnavailable(e.to_string())
    } else {
        ApiError::FailedDependency {
            code: codes::TRACK_EXCHANGE_FAULT,
            tag: "exchange-fault",
            hint: e.to_string(),
            detail: None,
        }
    }
}
