pub mod request;
pub mod row_set;
pub mod trade_date;
