mod cli;

use std::error::Error;
use std::fs;
use std::io::{self, Write};
use std::process::ExitCode;

use clap::Parser;
use cli::{Cli, Command};
use flat_fs_fuse::{format_image, mount_image, pack, read_file, write_file};

fn main() -> ExitCode {
    env_logger::init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("flat-fs-packer: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    let fs = match cli.command {
        Command::Mkfs { blocks, inodes } => format_image(&cli.image, blocks, inodes)?,
        _ => mount_image(&cli.image)?,
    };

    match cli.command {
        Command::Mkfs { blocks, inodes } => {
            println!("image={:?} blocks={blocks} inodes={inodes}", cli.image);
        }
        Command::Pack { source } => {
            for name in pack(&fs, &source)? {
                println!("packed: {name:?}");
            }
        }
        Command::Put { host, name } => {
            let name = match name {
                Some(name) => name,
                None => host
                    .file_name()
                    .and_then(|name| name.to_str())
                    .ok_or("host file name is not valid UTF-8")?
                    .to_owned(),
            };
            let data = fs::read(&host)?;
            write_file(&fs, &name, &data)?;
            fs.sync()?;
        }
        Command::Cat { name } => {
            let data = read_file(&fs, &name)?;
            io::stdout().write_all(&data)?;
        }
        Command::Rm { name } => fs.delete(&name)?,
        Command::Ls => {
            for (inode, name) in fs.list() {
                let stat = fs.stat(&name)?;
                println!("{:>5} {:>8} {name}", u16::from(inode), stat.size);
            }
            println!("free blocks: {}", fs.free_blocks()?);
        }
        Command::Stat { name } => {
            let stat = fs.stat(&name)?;
            println!("inode:  {}", stat.inode);
            println!("size:   {}", stat.size);
            println!("blocks: {}", stat.blocks);
            println!("state:  {}", stat.state);
            println!("open:   {}", stat.open_count);
        }
    }

    Ok(())
}
