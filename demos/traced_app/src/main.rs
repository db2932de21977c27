//! calltrace で記録するためのサンプルプログラム
//!
//! `calltrace trace target/debug/traced_app --pattern '^traced_app::' -- <mode>`
//! のように実行する。モード:
//!
//! - `ok`（既定）: 入れ子の呼び出しが正常に終わる
//! - `panic`: 3段目の関数でパニックする
//! - `abort`: `std::process::abort` で終了する
//! - `threads`: 複数スレッドで同じ関数を呼ぶ

use std::thread;

/// 構造体引数の表示確認用
#[derive(Debug, Clone, Copy)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

#[inline(never)]
fn checksum(data: &[u8]) -> u32 {
    data.iter().map(|&b| b as u32).sum()
}

#[inline(never)]
fn encode(label: &str, payload: Vec<u8>) -> usize {
    let sum = checksum(&payload);
    println!("encode({}) checksum={}", label, sum);
    payload.len()
}

#[inline(never)]
fn distance(origin: Point, target: Point) -> i64 {
    let dx = (target.x - origin.x) as i64;
    let dy = (target.y - origin.y) as i64;
    dx * dx + dy * dy
}

#[inline(never)]
fn validate(step: u32, limit: Option<u32>) -> u32 {
    match limit {
        Some(limit) if step > limit => panic!("step {} exceeds limit {}", step, limit),
        _ => step,
    }
}

#[inline(never)]
fn process(name: String, steps: u32, limit: Option<u32>) -> u32 {
    let mut total = 0;
    for step in 0..steps {
        total += validate(step, limit);
    }
    println!("process({}) total={}", name, total);
    total
}

#[inline(never)]
fn run(mode: &str) {
    let origin = Point { x: 0, y: 0 };
    let target = Point { x: 3, y: -4 };
    println!("distance = {}", distance(origin, target));
    encode("greeting", b"hello".to_vec());

    match mode {
        "panic" => {
            process(String::from("bounded"), 5, Some(2));
        }
        "abort" => {
            process(String::from("before-abort"), 2, None);
            std::process::abort();
        }
        "threads" => {
            let workers: Vec<_> = (0..3)
                .map(|i| {
                    thread::spawn(move || process(format!("worker-{}", i), i + 1, None))
                })
                .collect();
            for worker in workers {
                let _ = worker.join();
            }
        }
        _ => {
            process(String::from("main"), 3, None);
        }
    }
}

fn main() {
    let mode = std::env::args().nth(1).unwrap_or_else(|| "ok".to_string());
    println!("=== traced_app ({}) ===", mode);
    run(&mode);
    println!("done");
}
