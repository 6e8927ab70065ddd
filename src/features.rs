//! Per-customer feature aggregation

use ndarray::Array2;
use polars::prelude::*;
use serde::Serialize;
use tracing::{info, warn};

use crate::data::{TransactionSet, CHURN, CUSTOMER_NAME, RETURNS, TOTAL_AMOUNT};
use crate::error::{Result, SegmentationError};

/// Number of features each customer is described by
pub const N_FEATURES: usize = 4;

/// Column labels of the feature matrix, in matrix column order
pub const FEATURE_NAMES: [&str; N_FEATURES] = [
    "Total Purchases",
    "Average Purchase Amount",
    "Total Returns",
    "Churn Status",
];

const AMOUNT_COUNT: &str = "Amount Count";
const CHURN_COUNT: &str = "Churn Count";
const TRANSACTIONS: &str = "Transactions";

/// One of the four behavioral features, addressable by matrix column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, clap::ValueEnum)]
pub enum Feature {
    TotalPurchases,
    AveragePurchaseAmount,
    TotalReturns,
    ChurnStatus,
}

impl Feature {
    pub const ALL: [Feature; N_FEATURES] = [
        Feature::TotalPurchases,
        Feature::AveragePurchaseAmount,
        Feature::TotalReturns,
        Feature::ChurnStatus,
    ];

    pub fn index(self) -> usize {
        match self {
            Feature::TotalPurchases => 0,
            Feature::AveragePurchaseAmount => 1,
            Feature::TotalReturns => 2,
            Feature::ChurnStatus => 3,
        }
    }

    pub fn name(self) -> &'static str {
        FEATURE_NAMES[self.index()]
    }
}

/// Aggregated behavior of one customer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CustomerFeatures {
    pub customer_name: String,
    /// Sum of total purchase amount
    pub total_purchases: f64,
    /// Mean of total purchase amount
    pub average_purchase_amount: f64,
    /// Sum of returns, blanks counted as zero
    pub total_returns: f64,
    /// 1 if the customer churned in any transaction
    pub churn_status: f64,
    pub transactions: usize,
}

impl CustomerFeatures {
    pub fn values(&self) -> [f64; N_FEATURES] {
        [
            self.total_purchases,
            self.average_purchase_amount,
            self.total_returns,
            self.churn_status,
        ]
    }

    pub fn get(&self, feature: Feature) -> f64 {
        self.values()[feature.index()]
    }
}

/// Customer feature vectors in first-appearance order
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureTable {
    pub customers: Vec<CustomerFeatures>,
    /// Records dropped because their customer name was blank
    pub skipped_records: usize,
}

impl FeatureTable {
    /// Build a table directly from rows of `[total, average, returns, churn]`.
    ///
    /// Customers are named `customer-<row>`.
    pub fn from_rows(rows: &[[f64; N_FEATURES]]) -> Self {
        let customers = rows
            .iter()
            .enumerate()
            .map(|(i, row)| CustomerFeatures {
                customer_name: format!("customer-{i}"),
                total_purchases: row[0],
                average_purchase_amount: row[1],
                total_returns: row[2],
                churn_status: row[3],
                transactions: 1,
            })
            .collect();

        Self {
            customers,
            skipped_records: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.customers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.customers.is_empty()
    }

    /// Raw features as an (n_customers, 4) matrix
    pub fn to_matrix(&self) -> Array2<f64> {
        let mut matrix = Array2::zeros((self.customers.len(), N_FEATURES));
        for (mut row, customer) in matrix.outer_iter_mut().zip(&self.customers) {
            for (cell, value) in row.iter_mut().zip(customer.values()) {
                *cell = value;
            }
        }
        matrix
    }
}

/// Reduce transactions to one feature vector per customer name.
///
/// Rows without a customer name are skipped and counted. Groups keep the order in
/// which each customer first appears, so repeated calls agree row for row.
pub fn aggregate(transactions: &TransactionSet) -> Result<FeatureTable> {
    if transactions.is_empty() {
        return Err(SegmentationError::invalid_parameter(
            "transactions",
            "the transaction set is empty",
        ));
    }

    let frame = transactions.frame();
    let skipped_records = frame.column(CUSTOMER_NAME)?.null_count();
    if skipped_records > 0 {
        warn!(skipped_records, "skipping transactions without a customer name");
    }

    let grouped = frame
        .clone()
        .lazy()
        .filter(col(CUSTOMER_NAME).is_not_null())
        .group_by_stable([col(CUSTOMER_NAME)])
        .agg([
            col(TOTAL_AMOUNT).sum().alias(FEATURE_NAMES[0]),
            col(TOTAL_AMOUNT).mean().alias(FEATURE_NAMES[1]),
            col(RETURNS).fill_null(lit(0.0)).sum().alias(FEATURE_NAMES[2]),
            col(CHURN)
                .max()
                .cast(DataType::Float64)
                .alias(FEATURE_NAMES[3]),
            col(TOTAL_AMOUNT)
                .is_not_null()
                .sum()
                .cast(DataType::UInt64)
                .alias(AMOUNT_COUNT),
            col(CHURN)
                .is_not_null()
                .sum()
                .cast(DataType::UInt64)
                .alias(CHURN_COUNT),
            col(CUSTOMER_NAME)
                .len()
                .cast(DataType::UInt64)
                .alias(TRANSACTIONS),
        ])
        .collect()?;

    let names = grouped.column(CUSTOMER_NAME)?.str()?;
    let totals = grouped.column(FEATURE_NAMES[0])?.f64()?;
    let averages = grouped.column(FEATURE_NAMES[1])?.f64()?;
    let returns = grouped.column(FEATURE_NAMES[2])?.f64()?;
    let churn = grouped.column(FEATURE_NAMES[3])?.f64()?;
    let amount_counts = grouped.column(AMOUNT_COUNT)?.u64()?;
    let churn_counts = grouped.column(CHURN_COUNT)?.u64()?;
    let transaction_counts = grouped.column(TRANSACTIONS)?.u64()?;

    let mut customers = Vec::with_capacity(grouped.height());
    for i in 0..grouped.height() {
        let Some(name) = names.get(i) else {
            continue;
        };
        let has_amounts = amount_counts.get(i).unwrap_or(0) > 0;
        let has_churn = churn_counts.get(i).unwrap_or(0) > 0;

        customers.push(CustomerFeatures {
            customer_name: name.to_string(),
            // A sum over nothing but nulls would read as a genuine zero spend
            total_purchases: if has_amounts {
                totals.get(i).unwrap_or(f64::NAN)
            } else {
                f64::NAN
            },
            average_purchase_amount: averages.get(i).unwrap_or(f64::NAN),
            total_returns: returns.get(i).unwrap_or(0.0),
            churn_status: if has_churn {
                churn.get(i).unwrap_or(f64::NAN)
            } else {
                f64::NAN
            },
            transactions: transaction_counts.get(i).unwrap_or(0) as usize,
        });
    }

    if customers.is_empty() {
        return Err(SegmentationError::invalid_parameter(
            "transactions",
            format!("all {skipped_records} transactions lack a customer name"),
        ));
    }

    info!(
        customers = customers.len(),
        transactions = transactions.len(),
        "aggregated customer features"
    );

    Ok(FeatureTable {
        customers,
        skipped_records,
    })
}
