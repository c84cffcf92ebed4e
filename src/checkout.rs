//! Credit purchase stepper: package, customer details, payment method, then
//! either a card redirect or a mobile-money approval wait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::api::types::{
    Country, CreditPackage, InitiatePaymentRequest, InitiatePaymentResponse, PaymentMethod,
    VerifyPaymentResponse,
};
use crate::auth::AuthedApi;
use crate::db::SharedDb;
use crate::error::{ClientError, ClientResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NetworkInfo {
    pub id: &'static str,
    pub name: &'static str,
}

const fn net(id: &'static str, name: &'static str) -> NetworkInfo {
    NetworkInfo { id, name }
}

const CM: &[NetworkInfo] = &[net("MTN", "MTN Mobile Money"), net("ORANGE", "Orange Money")];
const CI: &[NetworkInfo] = &[
    net("MTN", "MTN Mobile Money"),
    net("ORANGE", "Orange Money"),
    net("MOOV", "Moov Money"),
];
const SN: &[NetworkInfo] = &[net("ORANGE", "Orange Money"), net("FREE", "Free Money")];
const GH: &[NetworkInfo] = &[
    net("MTN", "MTN MoMo"),
    net("VODAFONE", "Vodafone Cash"),
    net("AIRTELTIGO", "AirtelTigo Money"),
];
const KE: &[NetworkInfo] = &[net("MPESA", "M-Pesa"), net("AIRTEL", "Airtel Money")];
const UG: &[NetworkInfo] = &[net("MTN", "MTN MoMo"), net("AIRTEL", "Airtel Money")];

/// Mobile-money networks with a display name, per ISO country code.
pub fn networks_for(country_code: &str) -> &'static [NetworkInfo] {
    match country_code.to_ascii_uppercase().as_str() {
        "CM" => CM,
        "CI" => CI,
        "SN" => SN,
        "GH" => GH,
        "KE" => KE,
        "UG" => UG,
        _ => &[],
    }
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn initiate(&self, req: &InitiatePaymentRequest) -> ClientResult<InitiatePaymentResponse>;
    async fn verify(
        &self,
        tx_ref: &str,
        transaction_id: Option<&str>,
    ) -> ClientResult<VerifyPaymentResponse>;
}

#[async_trait]
impl PaymentGateway for AuthedApi {
    async fn initiate(&self, req: &InitiatePaymentRequest) -> ClientResult<InitiatePaymentResponse> {
        let api = &self.api;
        self.call(|token| async move { api.initiate_payment(req, &token).await })
            .await
    }

    async fn verify(
        &self,
        tx_ref: &str,
        transaction_id: Option<&str>,
    ) -> ClientResult<VerifyPaymentResponse> {
        let api = &self.api;
        self.call(|token| async move { api.verify_payment(tx_ref, transaction_id, &token).await })
            .await
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerInfo {
    pub name: String,
    /// ISO country code.
    pub country: String,
    pub phone: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Initiated {
    /// Card: continue on the provider's hosted page.
    Redirect { payment_link: String, tx_ref: String },
    /// Mobile money: the customer approves on their phone; track `tx_ref`
    /// with a payment watch.
    AwaitApproval {
        tx_ref: String,
        instructions: Option<String>,
    },
}

impl Initiated {
    pub fn tx_ref(&self) -> &str {
        match self {
            Self::Redirect { tx_ref, .. } | Self::AwaitApproval { tx_ref, .. } => tx_ref,
        }
    }
}

/// Query parameters the provider appends when redirecting back after a card
/// payment.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RedirectParams {
    pub status: Option<String>,
    pub tx_ref: Option<String>,
    pub transaction_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Checkout {
    step: u8,
    countries: Vec<Country>,
    package: Option<CreditPackage>,
    pub customer: CustomerInfo,
    method: Option<PaymentMethod>,
    network: Option<String>,
}

impl Checkout {
    pub fn new(countries: Vec<Country>) -> Self {
        Self {
            step: 1,
            countries,
            package: None,
            customer: CustomerInfo::default(),
            method: None,
            network: None,
        }
    }

    pub fn step(&self) -> u8 {
        self.step
    }

    pub fn package(&self) -> Option<&CreditPackage> {
        self.package.as_ref()
    }

    pub fn select_package(&mut self, package: CreditPackage) {
        self.package = Some(package);
    }

    pub fn select_method(&mut self, method: PaymentMethod, network: Option<String>) {
        self.method = Some(method);
        self.network = match method {
            PaymentMethod::MobileMoney => network.map(|n| n.to_ascii_uppercase()),
            PaymentMethod::Card => None,
        };
    }

    fn country(&self) -> Option<&Country> {
        self.countries
            .iter()
            .find(|c| c.code.eq_ignore_ascii_case(self.customer.country.trim()))
    }

    /// Networks offered for the selected country. Empty when the country
    /// does not support mobile money.
    pub fn available_networks(&self) -> &'static [NetworkInfo] {
        match self.country() {
            Some(c) if c.mobile_money => networks_for(&c.code),
            _ => &[],
        }
    }

    /// Move from step 1 to 3. Step 4 is only reached by [`initiate`](Self::initiate).
    pub fn next_step(&mut self) -> ClientResult<u8> {
        if self.step >= 3 {
            return Ok(self.step);
        }
        self.validate_step(self.step)?;
        self.step += 1;
        Ok(self.step)
    }

    pub fn previous_step(&mut self) -> u8 {
        if self.step > 1 && self.step < 4 {
            self.step -= 1;
        }
        self.step
    }

    pub fn validate_step(&self, step: u8) -> ClientResult<()> {
        match step {
            1 if self.package.is_none() => Err(ClientError::validation("Choose a credit package")),
            2 => {
                if self.customer.name.trim().is_empty() {
                    return Err(ClientError::validation("Enter your full name"));
                }
                if self.country().is_none() {
                    return Err(ClientError::validation("Select your country"));
                }
                normalize_phone(&self.customer.phone).map(|_| ())
            }
            3 => match self.method {
                None => Err(ClientError::validation("Choose a payment method")),
                Some(PaymentMethod::Card) => Ok(()),
                Some(PaymentMethod::MobileMoney) => {
                    let networks = self.available_networks();
                    if networks.is_empty() {
                        return Err(ClientError::validation(
                            "Mobile money is not available in your country",
                        ));
                    }
                    match &self.network {
                        Some(n) if networks.iter().any(|x| x.id == n.as_str()) => Ok(()),
                        _ => Err(ClientError::validation("Choose your mobile network")),
                    }
                }
            },
            _ => Ok(()),
        }
    }

    pub fn request(&self) -> ClientResult<InitiatePaymentRequest> {
        for step in 1..=3 {
            self.validate_step(step)?;
        }
        let package = self
            .package
            .as_ref()
            .ok_or_else(|| ClientError::validation("Choose a credit package"))?;
        Ok(InitiatePaymentRequest {
            package_id: package.id.clone(),
            customer_name: Some(self.customer.name.trim().to_string()),
            phone_number: Some(normalize_phone(&self.customer.phone)?),
            country_code: self.country().map(|c| c.code.clone()),
            payment_method: self.method,
            network: self.network.clone(),
        })
    }

    /// Start the payment. The transaction is recorded locally as pending.
    pub async fn initiate(
        &mut self,
        gateway: &dyn PaymentGateway,
        store: Option<&SharedDb>,
    ) -> ClientResult<Initiated> {
        let req = self.request()?;
        let resp = gateway.initiate(&req).await?;
        let tx_ref = resp.transaction_id.clone();
        let method = resp
            .payment_method
            .or(req.payment_method)
            .unwrap_or(PaymentMethod::Card);

        if let Some(db) = store {
            let method_str = match method {
                PaymentMethod::MobileMoney => "mobile_money",
                PaymentMethod::Card => "card",
            };
            match db.lock() {
                Ok(db) => {
                    if let Err(e) = db.insert_payment(&tx_ref, &req.package_id, method_str) {
                        warn!(%tx_ref, "failed to record payment: {e:#}");
                    }
                }
                Err(e) => warn!("db lock poisoned, payment not recorded: {e}"),
            }
        }

        let initiated = match (method, resp.payment_link) {
            (PaymentMethod::Card, Some(link)) | (PaymentMethod::MobileMoney, Some(link))
                if !link.is_empty() =>
            {
                Initiated::Redirect {
                    payment_link: link,
                    tx_ref,
                }
            }
            (PaymentMethod::Card, _) => {
                return Err(ClientError::provider(
                    "payment provider did not return a checkout link",
                ))
            }
            (PaymentMethod::MobileMoney, _) => Initiated::AwaitApproval {
                tx_ref,
                instructions: resp.instructions,
            },
        };
        info!(tx_ref = %initiated.tx_ref(), ?method, package_id = %req.package_id, "payment initiated");
        self.step = 4;
        Ok(initiated)
    }
}

/// Strip separators; keep a leading `+`. Six to fifteen digits.
fn normalize_phone(raw: &str) -> ClientResult<String> {
    let trimmed = raw.trim();
    let plus = trimmed.starts_with('+');
    let mut digits = String::with_capacity(trimmed.len());
    for (i, c) in trimmed.chars().enumerate() {
        match c {
            '0'..='9' => digits.push(c),
            ' ' | '-' | '.' | '(' | ')' => {}
            '+' if i == 0 => {}
            _ => return Err(ClientError::validation("Phone number may only contain digits")),
        }
    }
    if digits.is_empty() {
        return Err(ClientError::validation("Enter your phone number"));
    }
    if !(6..=15).contains(&digits.len()) {
        return Err(ClientError::validation("Phone number length looks wrong"));
    }
    Ok(if plus { format!("+{digits}") } else { digits })
}

/// Confirm a card payment after the provider redirected back.
pub async fn verify_redirect(
    gateway: &dyn PaymentGateway,
    params: &RedirectParams,
    store: Option<&SharedDb>,
) -> ClientResult<VerifyPaymentResponse> {
    let tx_ref = params
        .tx_ref
        .as_deref()
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ClientError::validation("Missing transaction reference"))?;

    if params.status.as_deref() == Some("cancelled") {
        record(store, tx_ref, "failed", Some("cancelled by customer"));
        return Err(ClientError::provider("Payment was cancelled"));
    }

    let resp = gateway
        .verify(tx_ref, params.transaction_id.as_deref())
        .await?;
    let status = if resp.success { "successful" } else { "failed" };
    record(store, tx_ref, status, resp.message.as_deref());
    if resp.success {
        info!(%tx_ref, "card payment verified");
        Ok(resp)
    } else {
        Err(ClientError::provider(
            resp.message
                .unwrap_or_else(|| "Payment could not be verified".to_string()),
        ))
    }
}

fn record(store: Option<&SharedDb>, tx_ref: &str, status: &str, message: Option<&str>) {
    let Some(db) = store else { return };
    match db.lock() {
        Ok(db) => {
            if let Err(e) = db.update_payment(tx_ref, status, message) {
                warn!(%tx_ref, "failed to record payment status: {e:#}");
            }
        }
        Err(e) => warn!("db lock poisoned, payment status not recorded: {e}"),
    }
}
