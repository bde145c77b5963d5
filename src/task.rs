// 该文件是 Xunshan （巡山） 项目的一部分。
// src/task.rs - 单线程协作式周期任务调度
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

//! 所有周期任务在同一线程上依次运行，每个任务只在自己的 `tick` 中拿到
//! 上下文的可变引用，因此任务之间共享的状态不需要加锁。

use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

/// 收到中断信号后等待正常退出的最长时间
pub const FORCE_EXIT_AFTER: Duration = Duration::from_secs(30);

/// 一次 `tick` 之后任务希望调度器做什么
#[derive(Debug)]
pub enum TaskFlow {
  Continue,
  /// 从调度器中移除该任务
  Remove,
  /// 正常结束整个调度循环
  Stop,
  /// 以错误结束整个调度循环
  Fail(anyhow::Error),
}

pub trait PeriodicTask<C> {
  fn name(&self) -> &str;
  fn period(&self) -> Duration;
  fn tick(&mut self, context: &mut C) -> TaskFlow;
}

struct Entry<C> {
  task: Box<dyn PeriodicTask<C>>,
  next: Instant,
  ticks: u64,
}

pub struct Scheduler<C> {
  context: C,
  tasks: Vec<Entry<C>>,
  shutdown: Option<Receiver<()>>,
}

impl<C> Scheduler<C> {
  pub fn new(context: C) -> Self {
    Self {
      context,
      tasks: Vec::new(),
      shutdown: None,
    }
  }

  /// 第一次调度在一个周期之后
  pub fn add_task(&mut self, task: Box<dyn PeriodicTask<C>>) {
    info!("添加周期任务 {}，周期 {:.2?}", task.name(), task.period());
    self.tasks.push(Entry {
      next: Instant::now() + task.period(),
      task,
      ticks: 0,
    });
  }

  /// 收到消息时结束调度循环
  pub fn with_shutdown_signal(mut self, receiver: Receiver<()>) -> Self {
    self.shutdown = Some(receiver);
    self
  }

  /// 安装 Ctrl-C 处理：通知调度器退出，超时未退出时强制结束进程
  pub fn install_ctrlc(self) -> anyhow::Result<Self> {
    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
      info!("收到中断信号，准备退出...");
      let _ = tx.send(());
      thread::spawn(|| {
        thread::sleep(FORCE_EXIT_AFTER);
        warn!("强制退出程序");
        std::process::exit(1);
      });
    })?;
    Ok(self.with_shutdown_signal(rx))
  }

  pub fn context(&self) -> &C {
    &self.context
  }

  pub fn context_mut(&mut self) -> &mut C {
    &mut self.context
  }

  pub fn into_context(self) -> C {
    self.context
  }

  pub fn task_count(&self) -> usize {
    self.tasks.len()
  }

  /// 等待到 `deadline`，期间收到退出信号则返回 true
  fn wait_until(&mut self, deadline: Instant) -> bool {
    let wait = deadline.saturating_duration_since(Instant::now());
    match &self.shutdown {
      Some(receiver) => match receiver.recv_timeout(wait) {
        Ok(()) => true,
        Err(RecvTimeoutError::Timeout) => false,
        Err(RecvTimeoutError::Disconnected) => {
          self.shutdown = None;
          thread::sleep(deadline.saturating_duration_since(Instant::now()));
          false
        }
      },
      None => {
        thread::sleep(wait);
        false
      }
    }
  }

  /// 运行到所有任务被移除、某个任务要求结束，或收到退出信号
  pub fn run(&mut self) -> anyhow::Result<()> {
    info!("开始调度 {} 个周期任务", self.tasks.len());
    loop {
      let Some(index) = self
        .tasks
        .iter()
        .enumerate()
        .min_by_key(|(_, entry)| entry.next)
        .map(|(index, _)| index)
      else {
        info!("没有剩余任务，退出调度循环");
        return Ok(());
      };

      let due = self.tasks[index].next;
      if due > Instant::now() {
        if self.wait_until(due) {
          warn!("中断信号接收，退出调度循环");
          return Ok(());
        }
        continue;
      }

      let dispatched = Instant::now();
      let entry = &mut self.tasks[index];
      entry.ticks += 1;
      debug!("执行任务 {} 第 {} 次", entry.task.name(), entry.ticks);
      let flow = entry.task.tick(&mut self.context);
      entry.next = dispatched + entry.task.period();

      match flow {
        TaskFlow::Continue => {}
        TaskFlow::Remove => {
          let entry = self.tasks.remove(index);
          info!("任务 {} 已移除", entry.task.name());
        }
        TaskFlow::Stop => {
          info!("任务 {} 结束调度循环", entry.task.name());
          return Ok(());
        }
        TaskFlow::Fail(e) => {
          return Err(e.context(format!("任务 {} 失败", entry.task.name())));
        }
      }
    }
  }
}
