//! Incremental fetch planning.
//!
//! For one (series table, instrument) pair the planner answers a single question:
//! from which date does the provider need to be asked? The answer only depends on
//! what is already stored and on the trading calendar:
//!
//! | stored state                         | plan                                  |
//! |--------------------------------------|---------------------------------------|
//! | table missing                        | `Fetch { start: epoch, fresh_table }` |
//! | table present, no rows for the code  | `Fetch { start: epoch }`              |
//! | latest date `d`, calendar has `> d`  | `Fetch { start: next calendar day }`  |
//! | latest date `d`, nothing after `d`   | `UpToDate`                            |

use market_data_ingestor::models::trade_date::TradeDate;
use serde::Serialize;

use crate::{
    calendar::CalendarTracker,
    catalog::SeriesTable,
    storage::{StorageError, StorageGateway},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "plan", rename_all = "snake_case")]
pub enum FetchPlan {
    /// Ask the provider for everything from `start` on.
    Fetch {
        start: TradeDate,
        /// The series table does not exist yet.
        fresh_table: bool,
    },
    UpToDate,
}

impl FetchPlan {
    pub fn start(&self) -> Option<TradeDate> {
        match self {
            FetchPlan::Fetch { start, .. } => Some(*start),
            FetchPlan::UpToDate => None,
        }
    }
}

#[derive(Clone)]
pub struct IncrementalFetchPlanner {
    storage: StorageGateway,
    calendar: CalendarTracker,
    epoch: TradeDate,
}

impl IncrementalFetchPlanner {
    pub fn new(storage: StorageGateway, calendar: CalendarTracker, epoch: TradeDate) -> Self {
        Self {
            storage,
            calendar,
            epoch,
        }
    }

    pub fn epoch(&self) -> TradeDate {
        self.epoch
    }

    pub fn plan(&self, series: &SeriesTable, code: &str) -> Result<FetchPlan, StorageError> {
        if !self.storage.table_exists(&series.table)? {
            return Ok(FetchPlan::Fetch {
                start: self.epoch,
                fresh_table: true,
            });
        }
        let latest =
            self.storage
                .latest_date(&series.table, &series.code_column, &series.date_column, code)?;
        let Some(latest) = latest else {
            return Ok(FetchPlan::Fetch {
                start: self.epoch,
                fresh_table: false,
            });
        };
        Ok(match self.calendar.next_date_after(series, code, latest)? {
            Some(start) => FetchPlan::Fetch {
                start,
                fresh_table: false,
            },
            None => FetchPlan::UpToDate,
        })
    }
}
