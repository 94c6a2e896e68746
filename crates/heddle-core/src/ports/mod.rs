//! Ports - 抽象化レイヤー
//!
//! pool が外側に依存する部分（時刻、ID 生成、ユニットの構築）を trait にしている。

pub mod clock;
pub mod id_generator;
pub mod unit_factory;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::unit_factory::UnitFactory;
