//! UnitFactory port - 実行ユニットの private state を作る
//!
//! 各ユニットは自分専用の HandlerRegistry を持つ（ユニット間でメモリを共有しない）。
//! pool は初期化時と置き換えのたびにこの factory を呼ぶ。

use crate::error::UnitInitError;
use crate::typed::HandlerRegistry;

/// Builds the handler registry owned by one execution unit.
///
/// `slot` is the pool position the unit will occupy; it stays the same across
/// replacements. Called while the pool registry lock is held, so it must not
/// call back into the pool.
pub trait UnitFactory: Send + Sync + 'static {
    fn create(&self, slot: usize) -> Result<HandlerRegistry, UnitInitError>;
}

impl<F> UnitFactory for F
where
    F: Fn(usize) -> Result<HandlerRegistry, UnitInitError> + Send + Sync + 'static,
{
    fn create(&self, slot: usize) -> Result<HandlerRegistry, UnitInitError> {
        self(slot)
    }
}
