//! Transaction records and the immutable record set, loaded with Polars

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{NaiveDate, NaiveDateTime};
use polars::prelude::*;
use tracing::{debug, info};

use crate::error::{Result, SegmentationError};

pub const CUSTOMER_ID: &str = "Customer ID";
pub const CUSTOMER_NAME: &str = "Customer Name";
pub const CUSTOMER_AGE: &str = "Customer Age";
pub const PURCHASE_DATE: &str = "Purchase Date";
pub const PRODUCT_CATEGORY: &str = "Product Category";
pub const PRODUCT_PRICE: &str = "Product Price";
pub const QUANTITY: &str = "Quantity";
pub const TOTAL_AMOUNT: &str = "Total Purchase Amount";
pub const PAYMENT_METHOD: &str = "Payment Method";
pub const GENDER: &str = "Gender";
pub const RETURNS: &str = "Returns";
pub const CHURN: &str = "Churn";

/// Columns segmentation cannot run without
pub const REQUIRED_COLUMNS: [&str; 4] = [CUSTOMER_NAME, TOTAL_AMOUNT, RETURNS, CHURN];

/// Some exports name the age column plainly
const AGE_ALIAS: &str = "Age";

const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

static NEXT_SET_ID: AtomicU64 = AtomicU64::new(1);

/// One purchase event
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransactionRecord {
    pub customer_id: Option<i64>,
    pub customer_name: Option<String>,
    pub age: Option<i64>,
    pub purchase_date: Option<NaiveDateTime>,
    pub product_category: Option<String>,
    pub product_price: Option<f64>,
    pub quantity: Option<i64>,
    pub total_purchase_amount: Option<f64>,
    pub payment_method: Option<String>,
    pub gender: Option<String>,
    /// Returned items; null when the source left it blank
    pub returns: Option<f64>,
    /// 0 or 1
    pub churn: Option<i64>,
}

impl TransactionRecord {
    /// A purchase of `amount` by `customer_name` with no returns and no churn
    pub fn purchase(customer_name: &str, amount: f64) -> Self {
        Self {
            customer_name: Some(customer_name.to_string()),
            total_purchase_amount: Some(amount),
            returns: Some(0.0),
            churn: Some(0),
            ..Self::default()
        }
    }

    pub fn with_returns(mut self, returns: Option<f64>) -> Self {
        self.returns = returns;
        self
    }

    pub fn with_churn(mut self, churn: i64) -> Self {
        self.churn = Some(churn);
        self
    }

    pub fn with_purchase_date(mut self, date: NaiveDateTime) -> Self {
        self.purchase_date = Some(date);
        self
    }
}

/// Read-only set of transactions backed by a columnar frame.
///
/// Every set gets a process-unique id at construction. Clones share the id, and
/// since the frame is never mutated the id identifies the content for caching.
#[derive(Debug, Clone)]
pub struct TransactionSet {
    id: u64,
    frame: DataFrame,
}

impl TransactionSet {
    /// Load transactions from a delimited file with a header row
    pub fn from_csv(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = LazyCsvReader::new(path)
            .with_has_header(true)
            .with_infer_schema_length(Some(10_000))
            .finish()?
            .collect()?;

        info!(path = %path.display(), rows = raw.height(), "loaded transaction file");
        Self::from_frame(raw)
    }

    /// Validate and normalize an already-loaded frame.
    ///
    /// Required columns must be present; optional ones are kept when they exist.
    /// Numeric columns are cast leniently so unparsable cells become nulls.
    pub fn from_frame(raw: DataFrame) -> Result<Self> {
        for name in REQUIRED_COLUMNS {
            if raw.column(name).is_err() {
                return Err(SegmentationError::data_quality(
                    name,
                    "required column is missing from the input",
                ));
            }
        }

        let mut exprs = vec![
            col(CUSTOMER_NAME).cast(DataType::String),
            col(TOTAL_AMOUNT).cast(DataType::Float64),
            col(RETURNS).cast(DataType::Float64),
            col(CHURN).cast(DataType::Int64),
        ];

        let optional = [
            (CUSTOMER_ID, DataType::Int64),
            (PURCHASE_DATE, DataType::String),
            (PRODUCT_CATEGORY, DataType::String),
            (PRODUCT_PRICE, DataType::Float64),
            (QUANTITY, DataType::Int64),
            (PAYMENT_METHOD, DataType::String),
            (GENDER, DataType::String),
        ];
        for (name, dtype) in optional {
            if raw.column(name).is_ok() {
                exprs.push(col(name).cast(dtype));
            }
        }

        if let Some(age) = [CUSTOMER_AGE, AGE_ALIAS]
            .into_iter()
            .find(|name| raw.column(name).is_ok())
        {
            exprs.push(col(age).cast(DataType::Int64).alias(CUSTOMER_AGE));
        }

        let frame = raw.lazy().select(exprs).collect()?;
        debug!(columns = frame.width(), "normalized transaction frame");

        Ok(Self::wrap(frame))
    }

    /// Build a set from in-memory records
    pub fn from_records(records: &[TransactionRecord]) -> Result<Self> {
        let frame = DataFrame::new(vec![
            Series::new(
                CUSTOMER_ID,
                records.iter().map(|r| r.customer_id).collect::<Vec<_>>(),
            ),
            Series::new(
                CUSTOMER_NAME,
                records
                    .iter()
                    .map(|r| r.customer_name.clone())
                    .collect::<Vec<_>>(),
            ),
            Series::new(CUSTOMER_AGE, records.iter().map(|r| r.age).collect::<Vec<_>>()),
            Series::new(
                PURCHASE_DATE,
                records
                    .iter()
                    .map(|r| r.purchase_date.map(|d| d.format(DATE_FORMAT).to_string()))
                    .collect::<Vec<_>>(),
            ),
            Series::new(
                PRODUCT_CATEGORY,
                records
                    .iter()
                    .map(|r| r.product_category.clone())
                    .collect::<Vec<_>>(),
            ),
            Series::new(
                PRODUCT_PRICE,
                records.iter().map(|r| r.product_price).collect::<Vec<_>>(),
            ),
            Series::new(QUANTITY, records.iter().map(|r| r.quantity).collect::<Vec<_>>()),
            Series::new(
                TOTAL_AMOUNT,
                records
                    .iter()
                    .map(|r| r.total_purchase_amount)
                    .collect::<Vec<_>>(),
            ),
            Series::new(
                PAYMENT_METHOD,
                records
                    .iter()
                    .map(|r| r.payment_method.clone())
                    .collect::<Vec<_>>(),
            ),
            Series::new(GENDER, records.iter().map(|r| r.gender.clone()).collect::<Vec<_>>()),
            Series::new(RETURNS, records.iter().map(|r| r.returns).collect::<Vec<_>>()),
            Series::new(CHURN, records.iter().map(|r| r.churn).collect::<Vec<_>>()),
        ])?;

        Ok(Self::wrap(frame))
    }

    fn wrap(frame: DataFrame) -> Self {
        Self {
            id: NEXT_SET_ID.fetch_add(1, Ordering::Relaxed),
            frame,
        }
    }

    /// Identity of this set's content
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn len(&self) -> usize {
        self.frame.height()
    }

    pub fn is_empty(&self) -> bool {
        self.frame.height() == 0
    }

    /// Normalized columnar view; derivations clone it lazily and never write back
    pub fn frame(&self) -> &DataFrame {
        &self.frame
    }

    /// Materialize the set as records, in file order
    pub fn records(&self) -> Result<Vec<TransactionRecord>> {
        let ids = self.i64_column(CUSTOMER_ID)?;
        let names = self.str_column(CUSTOMER_NAME)?;
        let ages = self.i64_column(CUSTOMER_AGE)?;
        let dates = self.str_column(PURCHASE_DATE)?;
        let categories = self.str_column(PRODUCT_CATEGORY)?;
        let prices = self.f64_column(PRODUCT_PRICE)?;
        let quantities = self.i64_column(QUANTITY)?;
        let amounts = self.f64_column(TOTAL_AMOUNT)?;
        let methods = self.str_column(PAYMENT_METHOD)?;
        let genders = self.str_column(GENDER)?;
        let returns = self.f64_column(RETURNS)?;
        let churn = self.i64_column(CHURN)?;

        let records = (0..self.len())
            .map(|i| TransactionRecord {
                customer_id: ids[i],
                customer_name: names[i].clone(),
                age: ages[i],
                purchase_date: dates[i].as_deref().and_then(parse_timestamp),
                product_category: categories[i].clone(),
                product_price: prices[i],
                quantity: quantities[i],
                total_purchase_amount: amounts[i],
                payment_method: methods[i].clone(),
                gender: genders[i].clone(),
                returns: returns[i],
                churn: churn[i],
            })
            .collect();

        Ok(records)
    }

    fn f64_column(&self, name: &str) -> Result<Vec<Option<f64>>> {
        match self.frame.column(name) {
            Ok(series) => Ok(series.f64()?.into_iter().collect()),
            Err(_) => Ok(vec![None; self.len()]),
        }
    }

    fn i64_column(&self, name: &str) -> Result<Vec<Option<i64>>> {
        match self.frame.column(name) {
            Ok(series) => Ok(series.i64()?.into_iter().collect()),
            Err(_) => Ok(vec![None; self.len()]),
        }
    }

    fn str_column(&self, name: &str) -> Result<Vec<Option<String>>> {
        match self.frame.column(name) {
            Ok(series) => Ok(series
                .str()?
                .into_iter()
                .map(|value| value.map(str::to_owned))
                .collect()),
            Err(_) => Ok(vec![None; self.len()]),
        }
    }
}

/// Accepts `YYYY-MM-DD HH:MM:SS`, RFC 3339-ish `YYYY-MM-DDTHH:MM:SS` and bare dates
fn parse_timestamp(value: &str) -> Option<NaiveDateTime> {
    let value = value.trim();
    NaiveDateTime::parse_from_str(value, DATE_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S"))
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(value, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_test_csv() -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "Customer ID,Purchase Date,Product Category,Product Price,Quantity,Total Purchase Amount,Payment Method,Customer Age,Returns,Customer Name,Age,Gender,Churn").unwrap();
        writeln!(file, "44605,2023-05-03 21:30:02,Home,177,1,2427,PayPal,31,1.0,John Rivera,31,Female,0").unwrap();
        writeln!(file, "44605,2021-05-16 13:57:44,Electronics,174,3,2448,PayPal,31,1.0,John Rivera,31,Female,0").unwrap();
        writeln!(file, "13738,2022-10-21 14:27:26,Books,493,2,1977,Cash,37,,Elizabeth Fowler,37,Male,1").unwrap();
        file
    }

    #[test]
    fn test_from_csv() {
        let file = create_test_csv();
        let set = TransactionSet::from_csv(file.path()).unwrap();

        assert_eq!(set.len(), 3);
        let records = set.records().unwrap();
        assert_eq!(records[0].customer_name.as_deref(), Some("John Rivera"));
        assert_eq!(records[0].total_purchase_amount, Some(2427.0));
        assert_eq!(records[0].age, Some(31));
        assert_eq!(records[2].returns, None);
        assert_eq!(records[2].churn, Some(1));
        assert_eq!(
            records[1].purchase_date,
            NaiveDate::from_ymd_opt(2021, 5, 16).and_then(|d| d.and_hms_opt(13, 57, 44))
        );
    }

    #[test]
    fn test_missing_required_column() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "Customer Name,Total Purchase Amount,Churn").unwrap();
        writeln!(file, "Ann,100,0").unwrap();

        let err = TransactionSet::from_csv(file.path()).unwrap_err();
        match err {
            SegmentationError::DataQuality { column, .. } => assert_eq!(column, RETURNS),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_from_records_reads_back() {
        let date = NaiveDate::from_ymd_opt(2023, 1, 2)
            .and_then(|d| d.and_hms_opt(3, 4, 5))
            .unwrap();
        let input = vec![
            TransactionRecord::purchase("Ann", 100.0).with_purchase_date(date),
            TransactionRecord::purchase("Bob", 50.0)
                .with_returns(None)
                .with_churn(1),
        ];

        let set = TransactionSet::from_records(&input).unwrap();
        assert_eq!(set.records().unwrap(), input);
    }

    #[test]
    fn test_clones_share_identity() {
        let records = [TransactionRecord::purchase("Ann", 1.0)];
        let set = TransactionSet::from_records(&records).unwrap();
        let other = TransactionSet::from_records(&records).unwrap();

        assert_eq!(set.clone().id(), set.id());
        assert_ne!(set.id(), other.id());
    }
}
