//! Tale Forge のジョブ監視コア。
//!
//! 外部ランナーが更新する生成ジョブ（ナレーション・画像・動画）を
//! ポーリングし、停滞を検出して自動／手動でリセットする。

pub mod domain;
pub mod infra;
pub mod usecase;
