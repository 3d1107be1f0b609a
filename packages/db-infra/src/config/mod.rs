pub mod db;
pub mod ledger;
