use clap::{Parser, Subcommand, ValueEnum};

use spte::layout::{
    MEMSLOT_GEN_UPDATE_IN_PROGRESS, MMIO_SPTE_GEN_HIGH_MASK, MMIO_SPTE_GEN_LOW_MASK,
    PAGE_SHIFT, REMOVED_SPTE, SHADOW_ACC_TRACK_SAVED_MASK, SPTE_BASE_ADDR_MASK,
    SPTE_MMU_PRESENT_MASK, SPTE_TDP_AD_MASK,
};
use spte::{
    Access, CpuFeatures, Decoded, Gfn, HumanSpte, LeafMapping, MaskConfig, MmuContext, PageLevel,
    PagingMode, Pfn, Spte, check_mmio_spte, generation_mmio_spte_mask, make_mmio_spte, make_spte,
    mark_spte_for_access_track, restore_acc_track_spte,
};

mod logger;

use logger::StderrLogger;

#[derive(Parser)]
#[command(name = "sptectl")]
#[command(about = "Shadow page table entry inspection tool")]
struct Args {
    /// Increase log verbosity (repeat for more)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(flatten)]
    cpu: CpuArgs,

    #[command(subcommand)]
    command: Command,
}

/// Hardware the mask layout is derived for.
#[derive(clap::Args)]
struct CpuArgs {
    /// Paging mode
    #[arg(long, value_enum, default_value_t = Mode::Shadow)]
    mode: Mode,

    /// Host physical address width
    #[arg(long, default_value_t = 46)]
    phys_bits: u8,

    /// EPT hardware without accessed/dirty bits
    #[arg(long)]
    no_ad: bool,

    /// EPT hardware without execute-only support
    #[arg(long)]
    no_exec_only: bool,

    /// Apply the L1TF mitigation for an L1 cache addressed with this many bits
    #[arg(long)]
    l1tf_cache_bits: Option<u8>,

    /// Disable MMIO caching
    #[arg(long)]
    no_mmio_caching: bool,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    Shadow,
    Ept,
}

#[derive(Subcommand)]
enum Command {
    /// Explain raw entry values
    Decode {
        /// Entries (hexadecimal with 0x prefix, or decimal)
        #[arg(required = true, value_parser = parse_number)]
        spte: Vec<u64>,

        /// Level of the table holding the entries (1 = 4K)
        #[arg(short, long, value_parser = parse_level)]
        level: Option<PageLevel>,
    },
    /// Encode or decode an MMIO generation
    Gen {
        #[command(subcommand)]
        command: GenCommand,
    },
    /// Build an MMIO placeholder entry
    Mmio {
        #[arg(long, value_parser = parse_number)]
        gfn: u64,

        /// Access letters: x (exec), w (write), u (user)
        #[arg(long, default_value = "wu", value_parser = parse_access)]
        access: Access,

        /// Memslot generation
        #[arg(long, default_value = "0", value_parser = parse_number)]
        generation: u64,
    },
    /// Build a leaf entry
    Leaf {
        #[arg(long, value_parser = parse_number)]
        gfn: u64,

        #[arg(long, value_parser = parse_number)]
        pfn: u64,

        /// Access letters: x (exec), w (write), u (user)
        #[arg(long, default_value = "xwu", value_parser = parse_access)]
        access: Access,

        /// Level of the mapping (1 = 4K)
        #[arg(long, default_value = "1", value_parser = parse_level)]
        level: PageLevel,

        /// Prefetched rather than faulted in
        #[arg(long)]
        speculative: bool,

        /// Owning page doesn't use hardware accessed/dirty bits
        #[arg(long)]
        ad_disabled: bool,

        /// Host mapping is read-only
        #[arg(long)]
        host_read_only: bool,

        /// Guest page is write-tracked
        #[arg(long)]
        write_tracked: bool,
    },
    /// Age an entry and show how it is restored
    Track {
        #[arg(value_parser = parse_number)]
        spte: u64,
    },
    /// Print the bit layout and the active mask configuration
    Layout,
}

#[derive(Subcommand)]
enum GenCommand {
    /// Show where a generation lands in an entry
    Encode {
        #[arg(value_parser = parse_number)]
        generation: u64,
    },
    /// Extract the generation from an entry
    Decode {
        #[arg(value_parser = parse_number)]
        spte: u64,

        /// Live memslot generation to check the entry against
        #[arg(long, value_parser = parse_number)]
        live: Option<u64>,
    },
}

/// Fixed MMU policy used when synthesizing entries.
///
/// TDP mappings of RAM get the write-back memory type; nothing is MMIO-backed and only
/// an explicitly write-tracked GFN is write-protected.
struct CliMmu {
    generation: u64,
    tdp: bool,
    write_tracked: Option<Gfn>,
}

impl MmuContext for CliMmu {
    fn memslot_generation(&self) -> u64 {
        self.generation
    }

    fn tdp_enabled(&self) -> bool {
        self.tdp
    }

    fn need_write_protect(&self, gfn: Gfn, _can_unsync: bool) -> bool {
        self.write_tracked == Some(gfn)
    }

    fn memory_type_mask(&self, _gfn: Gfn, is_mmio: bool) -> u64 {
        const MEMORY_TYPE_SHIFT: u64 = 3;
        const WRITE_BACK: u64 = 6;

        if is_mmio { 0 } else { WRITE_BACK << MEMORY_TYPE_SHIFT }
    }
}

fn parse_number(s: &str) -> Result<u64, std::num::ParseIntError> {
    let s = s.replace('_', "");
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
    } else {
        s.parse::<u64>()
    }
}

fn parse_level(s: &str) -> Result<PageLevel, String> {
    let raw = s.parse::<u8>().map_err(|e| e.to_string())?;
    PageLevel::from_raw(raw).ok_or_else(|| format!("level must be 1-5, got {}", raw))
}

fn parse_access(s: &str) -> Result<Access, String> {
    s.chars().try_fold(Access::empty(), |access, c| match c {
        'x' => Ok(access | Access::EXEC),
        'w' => Ok(access | Access::WRITE),
        'u' => Ok(access | Access::USER),
        '-' => Ok(access),
        _ => Err(format!("unknown access letter '{}'", c)),
    })
}

fn build_config(cpu: &CpuArgs) -> MaskConfig {
    let features = CpuFeatures {
        phys_bits: cpu.phys_bits,
        cache_bits: cpu.l1tf_cache_bits.unwrap_or(cpu.phys_bits),
        l1tf: cpu.l1tf_cache_bits.is_some(),
        ept_ad_bits: !cpu.no_ad,
        ept_exec_only: !cpu.no_exec_only,
        mmio_caching: !cpu.no_mmio_caching,
        ..CpuFeatures::default()
    };

    match cpu.mode {
        Mode::Shadow => MaskConfig::shadow_paging(&features),
        Mode::Ept => MaskConfig::ept(&features),
    }
}

fn decode(masks: &MaskConfig, sptes: Vec<u64>, level: Option<PageLevel>) {
    for (index, raw) in sptes.into_iter().enumerate() {
        if index != 0 {
            println!();
        }

        let decoded = Decoded::new(masks, Spte::new(raw));
        match level {
            Some(level) => print!("{}", decoded.at_level(level)),
            None => print!("{}", decoded),
        }
    }
}

fn generation(command: GenCommand) {
    match command {
        GenCommand::Encode { generation } => {
            println!("{}", HumanSpte(generation_mmio_spte_mask(generation)));
        }
        GenCommand::Decode { spte, live } => {
            let spte = Spte::new(spte);
            println!("generation: {:#x}", spte.mmio_generation());
            if let Some(live) = live {
                let state = if check_mmio_spte(spte, live) { "current" } else { "stale" };
                println!("state:      {}", state);
            }
        }
    }
}

fn track(masks: &MaskConfig, raw: u64) -> Result<(), Box<dyn std::error::Error>> {
    let spte = Spte::new(raw);
    if spte.is_removed() || !spte.is_shadow_present() {
        return Err(format!("{} is not a present entry", HumanSpte(raw)).into());
    }

    let aged = mark_spte_for_access_track(masks, spte);
    println!("aged:       {}", HumanSpte::from(aged));

    if aged.ad_enabled() {
        println!("restored:   by the next guest access setting the accessed bit");
    } else {
        let restored = restore_acc_track_spte(masks, aged);
        println!("restored:   {}", HumanSpte::from(restored));
    }

    Ok(())
}

fn layout(masks: &MaskConfig) {
    let constants = [
        ("present marker", SPTE_MMU_PRESENT_MASK),
        ("frame", SPTE_BASE_ADDR_MASK),
        ("a/d type", SPTE_TDP_AD_MASK),
        ("saved r/x", SHADOW_ACC_TRACK_SAVED_MASK),
        ("generation low", MMIO_SPTE_GEN_LOW_MASK),
        ("generation high", MMIO_SPTE_GEN_HIGH_MASK),
        ("update flag", MEMSLOT_GEN_UPDATE_IN_PROGRESS),
        ("removed", REMOVED_SPTE),
    ];
    for (name, value) in constants {
        println!("{:<16} {}", name, HumanSpte(value));
    }

    println!();
    println!("{:<16} {}", "mode", masks.mode());
    println!("{:<16} {}", "phys bits", masks.phys_bits());

    let runtime = [
        ("user", masks.user_mask()),
        ("accessed", masks.accessed_mask()),
        ("dirty", masks.dirty_mask()),
        ("nx", masks.nx_mask()),
        ("x", masks.x_mask()),
        ("present", masks.present_mask()),
        ("access track", masks.acc_track_mask()),
        ("encryption", masks.me_mask()),
        ("host writable", masks.host_writable_mask()),
        ("mmu writable", masks.mmu_writable_mask()),
        ("l1tf reserved", masks.nonpresent_or_rsvd_mask()),
        ("gfn", masks.nonpresent_or_rsvd_lower_gfn_mask()),
        ("mmio value", masks.mmio_value()),
        ("mmio mask", masks.mmio_mask()),
    ];
    for (name, value) in runtime {
        println!("{:<16} {}", name, HumanSpte(value));
    }
    println!("{:<16} {:?}", "mmio access", masks.mmio_access_mask());
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    StderrLogger::init(args.verbose)?;
    let masks = MaskConfig::install(build_config(&args.cpu))?;
    let tdp = masks.mode() == PagingMode::Ept;

    match args.command {
        Command::Decode { spte, level } => decode(masks, spte, level),
        Command::Gen { command } => generation(command),
        Command::Mmio {
            gfn,
            access,
            generation,
        } => {
            let mmu = CliMmu {
                generation,
                tdp,
                write_tracked: None,
            };
            let spte = make_mmio_spte(masks, &mmu, Gfn::new(gfn), access);
            print!("{}", Decoded::new(masks, spte));
        }
        Command::Leaf {
            gfn,
            pfn,
            access,
            level,
            speculative,
            ad_disabled,
            host_read_only,
            write_tracked,
        } => {
            if pfn > SPTE_BASE_ADDR_MASK >> PAGE_SHIFT
                || (pfn << PAGE_SHIFT) & !masks.base_addr_mask() != 0
            {
                return Err(format!("pfn {:#x} does not fit the frame field", pfn).into());
            }

            let gfn = Gfn::new(gfn);
            let mmu = CliMmu {
                generation: 0,
                tdp,
                write_tracked: write_tracked.then_some(gfn),
            };
            let leaf = LeafMapping {
                speculative,
                ad_disabled,
                host_writable: !host_read_only,
                ..LeafMapping::new(gfn, Pfn::new(pfn), level, access)
            };

            let (flags, spte) = make_spte(masks, &mmu, &leaf);
            if !flags.is_empty() {
                println!("flags:      {:?}", flags);
            }
            print!("{}", Decoded::new(masks, spte).at_level(level));
        }
        Command::Track { spte } => track(masks, spte)?,
        Command::Layout => layout(masks),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers() {
        assert_eq!(parse_number("0x5a0").unwrap(), 0x5A0);
        assert_eq!(parse_number("0x8000_0000_1234_5867").unwrap(), 0x8000_0000_1234_5867);
        assert_eq!(parse_number("4096").unwrap(), 4096);
        assert!(parse_number("0xzz").is_err());
    }

    #[test]
    fn levels() {
        assert_eq!(parse_level("2").unwrap(), PageLevel::Level2M);
        assert!(parse_level("0").is_err());
        assert!(parse_level("six").is_err());
    }

    #[test]
    fn access_letters() {
        assert_eq!(parse_access("xwu").unwrap(), Access::ALL);
        assert_eq!(parse_access("-w-").unwrap(), Access::WRITE);
        assert_eq!(parse_access("").unwrap(), Access::empty());
        assert!(parse_access("r").is_err());
    }

    #[test]
    fn config_from_flags() {
        let args = Args::parse_from(["sptectl", "--mode", "ept", "--no-ad", "layout"]);
        let masks = build_config(&args.cpu);
        assert_eq!(masks.mode(), PagingMode::Ept);
        assert!(!masks.ad_supported());

        let args = Args::parse_from(["sptectl", "--l1tf-cache-bits", "44", "layout"]);
        assert_ne!(build_config(&args.cpu).nonpresent_or_rsvd_mask(), 0);

        let args = Args::parse_from(["sptectl", "--no-mmio-caching", "layout"]);
        assert!(!build_config(&args.cpu).mmio_caching_enabled());
    }

    #[test]
    fn cli_is_consistent() {
        use clap::CommandFactory;
        Args::command().debug_assert();
    }
}
