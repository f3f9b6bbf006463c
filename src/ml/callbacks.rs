//! エポック終了時の制御（早期終了・学習率減衰・チェックポイント判定）
//!
//! いずれもテンソルに依存しない状態機械で、検証指標を1エポックずつ受け取ります。
//! 早期終了と学習率減衰はフェーズごとに作り直し、チェックポイント判定は
//! 両フェーズを通して1つを使います。

/// 検証損失による早期終了
///
/// `val_loss < best` のときだけ改善とみなし、改善が `patience` エポック続かなければ
/// 停止を指示します。改善時のスナップショットを保持し、停止時に取り出せます。
#[derive(Debug, Clone)]
pub struct EarlyStopping<S> {
    patience: usize,
    best: f64,
    best_epoch: Option<usize>,
    wait: usize,
    stopped_epoch: Option<usize>,
    snapshot: Option<S>,
}

impl<S> EarlyStopping<S> {
    pub fn new(patience: usize) -> Self {
        Self {
            patience,
            best: f64::INFINITY,
            best_epoch: None,
            wait: 0,
            stopped_epoch: None,
            snapshot: None,
        }
    }

    /// エポック結果を記録し、停止すべきなら `true`
    ///
    /// `snapshot` は改善したときだけ呼ばれます。
    pub fn observe(&mut self, epoch: usize, val_loss: f64, snapshot: impl FnOnce() -> S) -> bool {
        if val_loss < self.best {
            self.best = val_loss;
            self.best_epoch = Some(epoch);
            self.wait = 0;
            self.snapshot = Some(snapshot());
            return false;
        }

        self.wait += 1;
        if self.wait >= self.patience {
            self.stopped_epoch = Some(epoch);
            return true;
        }
        false
    }

    pub fn best(&self) -> f64 {
        self.best
    }

    pub fn best_epoch(&self) -> Option<usize> {
        self.best_epoch
    }

    pub fn wait(&self) -> usize {
        self.wait
    }

    pub fn stopped_epoch(&self) -> Option<usize> {
        self.stopped_epoch
    }

    /// 最良スナップショットを取り出す
    pub fn take_best(&mut self) -> Option<S> {
        self.snapshot.take()
    }
}

/// 検証損失の停滞による学習率減衰
#[derive(Debug, Clone)]
pub struct ReduceLrOnPlateau {
    factor: f64,
    patience: usize,
    min_lr: f64,
    min_delta: f64,
    best: f64,
    wait: usize,
}

impl ReduceLrOnPlateau {
    pub fn new(factor: f64, patience: usize, min_lr: f64, min_delta: f64) -> Self {
        Self {
            factor,
            patience,
            min_lr,
            min_delta,
            best: f64::INFINITY,
            wait: 0,
        }
    }

    /// エポック結果を記録し、次のエポックの学習率を返す
    pub fn observe(&mut self, val_loss: f64, lr: f64) -> f64 {
        if val_loss < self.best - self.min_delta {
            self.best = val_loss;
            self.wait = 0;
            return lr;
        }

        self.wait += 1;
        if self.wait >= self.patience && lr > self.min_lr {
            self.wait = 0;
            return (lr * self.factor).max(self.min_lr);
        }
        lr
    }

    pub fn wait(&self) -> usize {
        self.wait
    }
}

/// 検証正解率による最良チェックポイントの判定
#[derive(Debug, Clone, Default)]
pub struct CheckpointTracker {
    best: Option<f64>,
}

impl CheckpointTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// これまでの最良を厳密に上回ったら `true`
    pub fn observe(&mut self, val_accuracy: f64) -> bool {
        if val_accuracy.is_nan() {
            return false;
        }
        match self.best {
            Some(best) if val_accuracy <= best => false,
            _ => {
                self.best = Some(val_accuracy);
                true
            }
        }
    }

    pub fn best(&self) -> Option<f64> {
        self.best
    }
}
